//! The compiled JSON artifact: every type, procedure and string of a project in one document.
//!
//! Procedure bytecode is stored base64-encoded. An artifact records the fingerprint of the opcode table it was
//! built against, and loading refuses artifacts whose fingerprint does not match this build.

use std::fs;
use std::path::Path;

use base64::engine::Engine as Base64Engine;
use serde::{Serialize, Deserialize};
use tracing::debug;

use crate::annotated::{AnnotatedItem, StringTable};
use crate::bytecode::{self, Disassembly, EncodedProc, LocalVariableInfo, SourceInfo};
use crate::error::{ArtifactError, EncodeError};
use crate::opcode::compute_isa_fingerprint;

/// Version of the artifact layout written by [`ArtifactBuilder`].
pub const ARTIFACT_VERSION: u32 = 1;

/// Name of the root type, which also owns the global procs.
pub const ROOT_TYPE: &str = "/";

pub fn base64_encode(content: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(content)
}
pub fn base64_decode(content: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(content)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub version: u32,
    pub isa_fingerprint: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeJson {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_proc: Option<usize>,
    /// One list per proc name, holding the id of the declaration followed by the ids of its overrides.
    #[serde(default)]
    pub procs: Vec<Vec<usize>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentJson {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcJson {
    pub owning_type_id: usize,
    pub name: String,
    #[serde(default)]
    pub is_override: bool,
    #[serde(default)]
    pub arguments: Vec<ArgumentJson>,
    /// Base64 of the encoded instructions.
    #[serde(default)]
    pub bytecode: String,
    #[serde(default)]
    pub locals: Vec<LocalVariableInfo>,
    #[serde(default)]
    pub source_info: Vec<SourceInfo>,
    #[serde(default)]
    pub max_stack_size: i32,
}
impl ProcJson {
    pub fn bytes(&self) -> Result<Vec<u8>, ArtifactError> {
        Ok(base64_decode(&self.bytecode)?)
    }
    /// Decodes the bytecode into a listing. Malformed instructions are reported inside the [`Disassembly`].
    pub fn disassemble(&self, strings: &StringTable) -> Result<Disassembly, ArtifactError> {
        Ok(bytecode::disassemble(&self.bytes()?, strings))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalsJson {
    pub global_count: usize,
    #[serde(default)]
    pub names: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompiledJson {
    pub metadata: ArtifactMetadata,
    #[serde(default)]
    pub strings: Vec<String>,
    #[serde(default)]
    pub types: Vec<TypeJson>,
    #[serde(default)]
    pub procs: Vec<ProcJson>,
    #[serde(default)]
    pub global_procs: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_init_proc: Option<usize>,
    #[serde(default)]
    pub globals: GlobalsJson,
}
impl CompiledJson {
    /// Parses an artifact and checks that it was built for this opcode table.
    pub fn from_json(text: &str) -> Result<Self, ArtifactError> {
        let res: Self = serde_json::from_str(text)?;
        let expected = compute_isa_fingerprint();
        if res.metadata.isa_fingerprint != expected {
            return Err(ArtifactError::FingerprintMismatch { expected, found: res.metadata.isa_fingerprint });
        }
        debug!(types = res.types.len(), procs = res.procs.len(), strings = res.strings.len(), "loaded artifact");
        Ok(res)
    }
    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        let text = fs::read_to_string(path).map_err(|source| ArtifactError::Io { path: path.to_owned(), source })?;
        Self::from_json(&text)
    }
    pub fn to_json(&self) -> Result<String, ArtifactError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn string_table(&self) -> StringTable {
        self.strings.iter().collect()
    }

    pub fn type_id(&self, path: &str) -> Result<usize, ArtifactError> {
        self.types.iter().position(|x| x.path == path).ok_or_else(|| ArtifactError::UnknownType { path: path.into() })
    }

    /// The procs visible on a type, by name, each resolved to its most derived override.
    /// The root type also lists the global procs.
    pub fn procs_of(&self, type_id: usize) -> Vec<(usize, &ProcJson)> {
        let mut res = vec![];
        let Some(ty) = self.types.get(type_id) else { return res };
        for chain in ty.procs.iter() {
            if let Some(&id) = chain.last() {
                if let Some(proc) = self.procs.get(id) {
                    res.push((id, proc));
                }
            }
        }
        if ty.path == ROOT_TYPE {
            res.extend(self.global_procs.iter().filter_map(|&id| self.procs.get(id).map(|x| (id, x))));
        }
        res
    }

    /// Looks up a proc by type path and name. `<init>` names the type's init proc (or the global init proc
    /// on the root type), and `<global_init>` always names the global init proc.
    pub fn find_proc(&self, path: &str, name: &str) -> Result<&ProcJson, ArtifactError> {
        let unknown = || ArtifactError::UnknownProc { path: path.into(), name: name.into() };
        let global_init = || self.global_init_proc.and_then(|id| self.procs.get(id)).ok_or_else(unknown);

        if name == "<global_init>" || (name == "<init>" && path == ROOT_TYPE) {
            return global_init();
        }
        let type_id = self.type_id(path)?;
        if name == "<init>" {
            return self.types[type_id].init_proc.and_then(|id| self.procs.get(id)).ok_or_else(unknown);
        }
        self.procs_of(type_id).into_iter().find(|(_, x)| x.name == name).map(|(_, x)| x).ok_or_else(unknown)
    }

    /// A readable path for a proc, such as `/mob/proc/attack(target)`.
    pub fn proc_path(&self, proc: &ProcJson) -> String {
        let path = self.types.get(proc.owning_type_id).map(|x| x.path.as_str()).unwrap_or(ROOT_TYPE);
        let sep = if path.ends_with('/') { "" } else { "/" };
        let kind = if proc.is_override { "" } else { "proc/" };
        let args = proc.arguments.iter().map(|x| x.name.as_str()).collect::<Vec<_>>().join(", ");
        format!("{path}{sep}{kind}{}({args})", proc.name)
    }
}

/// Assembles a [`CompiledJson`] from encoded procedures.
///
/// The root type `/` always exists with id `0`. All procs share one [`StringTable`].
pub struct ArtifactBuilder {
    strings: StringTable,
    types: Vec<TypeJson>,
    procs: Vec<ProcJson>,
    global_procs: Vec<usize>,
    global_init_proc: Option<usize>,
    globals: Vec<String>,
}
impl Default for ArtifactBuilder {
    fn default() -> Self {
        Self::new()
    }
}
impl ArtifactBuilder {
    pub fn new() -> Self {
        Self {
            strings: StringTable::new(),
            types: vec![TypeJson { path: ROOT_TYPE.into(), parent: None, init_proc: None, procs: vec![] }],
            procs: vec![],
            global_procs: vec![],
            global_init_proc: None,
            globals: vec![],
        }
    }
    pub fn strings_mut(&mut self) -> &mut StringTable {
        &mut self.strings
    }
    /// Encodes a procedure against the shared string table.
    pub fn encode(&mut self, items: &[AnnotatedItem]) -> Result<EncodedProc, EncodeError> {
        bytecode::encode(items, &mut self.strings)
    }

    /// Adds a type, defaulting its parent to the root type. Returns the type id.
    pub fn add_type(&mut self, path: &str, parent: Option<usize>) -> usize {
        let id = self.types.len();
        self.types.push(TypeJson { path: path.into(), parent: parent.or(Some(0)), init_proc: None, procs: vec![] });
        id
    }
    pub fn add_global(&mut self, name: &str) -> usize {
        self.globals.push(name.into());
        self.globals.len() - 1
    }

    fn push_proc(&mut self, owner: usize, name: &str, arguments: &[&str], is_override: bool, encoded: EncodedProc) -> usize {
        self.procs.push(ProcJson {
            owning_type_id: owner,
            name: name.into(),
            is_override,
            arguments: arguments.iter().map(|x| ArgumentJson { name: (*x).into() }).collect(),
            bytecode: base64_encode(&encoded.bytecode),
            locals: encoded.locals,
            source_info: encoded.source_info,
            max_stack_size: encoded.max_stack_size,
        });
        self.procs.len() - 1
    }
    fn chain_index(&self, type_id: usize, name: &str) -> Option<usize> {
        self.types[type_id].procs.iter().position(|chain| chain.first().is_some_and(|&id| self.procs[id].name == name))
    }
    fn inherited_chain(&self, type_id: usize, name: &str) -> Option<Vec<usize>> {
        let mut current = self.types[type_id].parent;
        while let Some(ty) = current {
            if let Some(i) = self.chain_index(ty, name) {
                return Some(self.types[ty].procs[i].clone());
            }
            current = self.types[ty].parent;
        }
        None
    }

    /// Adds a proc to a type. A proc whose name is already declared on the type or one of its
    /// ancestors is recorded as an override. Returns the proc id.
    pub fn add_proc(&mut self, owner: usize, name: &str, arguments: &[&str], encoded: EncodedProc) -> usize {
        if let Some(i) = self.chain_index(owner, name) {
            let id = self.push_proc(owner, name, arguments, true, encoded);
            self.types[owner].procs[i].push(id);
            return id;
        }
        match self.inherited_chain(owner, name) {
            Some(mut chain) => {
                let id = self.push_proc(owner, name, arguments, true, encoded);
                chain.push(id);
                self.types[owner].procs.push(chain);
                id
            }
            None => {
                let id = self.push_proc(owner, name, arguments, false, encoded);
                self.types[owner].procs.push(vec![id]);
                id
            }
        }
    }
    pub fn add_global_proc(&mut self, name: &str, arguments: &[&str], encoded: EncodedProc) -> usize {
        let id = self.push_proc(0, name, arguments, false, encoded);
        self.global_procs.push(id);
        id
    }
    pub fn set_init_proc(&mut self, type_id: usize, encoded: EncodedProc) -> usize {
        let id = self.push_proc(type_id, "<init>", &[], false, encoded);
        self.types[type_id].init_proc = Some(id);
        id
    }
    pub fn set_global_init_proc(&mut self, encoded: EncodedProc) -> usize {
        let id = self.push_proc(0, "<global_init>", &[], false, encoded);
        self.global_init_proc = Some(id);
        id
    }

    pub fn finish(self) -> CompiledJson {
        CompiledJson {
            metadata: ArtifactMetadata { version: ARTIFACT_VERSION, isa_fingerprint: compute_isa_fingerprint() },
            strings: self.strings.iter().map(String::from).collect(),
            types: self.types,
            procs: self.procs,
            global_procs: self.global_procs,
            global_init_proc: self.global_init_proc,
            globals: GlobalsJson { global_count: self.globals.len(), names: self.globals },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotated::{Instruction, Operand};
    use crate::opcode::Opcode;

    fn greet(builder: &mut ArtifactBuilder, text: &str) -> EncodedProc {
        let items: Vec<AnnotatedItem> = vec![
            Instruction::new(Opcode::PushString, vec![Operand::string(text)]).unwrap().at_line(3).into(),
            Instruction::simple(Opcode::Return).unwrap().at_line(4).into(),
        ];
        builder.encode(&items).unwrap()
    }

    fn sample() -> CompiledJson {
        let mut builder = ArtifactBuilder::new();
        let mob = builder.add_type("/mob", None);
        let player = builder.add_type("/mob/player", Some(mob));
        let a = greet(&mut builder, "hello");
        builder.add_proc(mob, "greet", &["who"], a);
        let b = greet(&mut builder, "hi");
        builder.add_proc(player, "greet", &["who"], b);
        let c = greet(&mut builder, "init");
        builder.set_init_proc(mob, c);
        let d = greet(&mut builder, "world");
        builder.add_global_proc("setup", &[], d);
        let e = greet(&mut builder, "globals");
        builder.set_global_init_proc(e);
        builder.add_global("score");
        builder.finish()
    }

    #[test]
    fn test_builder_overrides() {
        let artifact = sample();
        assert_eq!(artifact.types.len(), 3);
        assert_eq!(artifact.types[2].procs, vec![vec![0, 1]]);
        assert!(!artifact.procs[0].is_override);
        assert!(artifact.procs[1].is_override);
        assert_eq!(artifact.proc_path(&artifact.procs[0]), "/mob/proc/greet(who)");
        assert_eq!(artifact.proc_path(&artifact.procs[1]), "/mob/player/greet(who)");
        assert_eq!(artifact.globals, GlobalsJson { global_count: 1, names: vec!["score".into()] });
    }

    #[test]
    fn test_lookup() {
        let artifact = sample();
        let strings = artifact.string_table();
        let proc = artifact.find_proc("/mob/player", "greet").unwrap();
        assert_eq!(proc.disassemble(&strings).unwrap().to_string(), "\tPushString \"hi\"\n\tReturn\n");
        assert_eq!(artifact.find_proc("/mob", "<init>").unwrap().name, "<init>");
        assert_eq!(artifact.find_proc("/", "<init>").unwrap().name, "<global_init>");
        assert_eq!(artifact.find_proc("/mob", "<global_init>").unwrap().name, "<global_init>");
        assert_eq!(artifact.find_proc("/", "setup").unwrap().name, "setup");
        assert!(matches!(artifact.find_proc("/mob/player", "<init>"), Err(ArtifactError::UnknownProc { .. })));
        assert!(matches!(artifact.find_proc("/obj", "greet"), Err(ArtifactError::UnknownType { .. })));
        assert!(matches!(artifact.find_proc("/mob", "attack"), Err(ArtifactError::UnknownProc { .. })));
    }

    #[test]
    fn test_json_reload() {
        let artifact = sample();
        let text = artifact.to_json().unwrap();
        let back = CompiledJson::from_json(&text).unwrap();
        assert_eq!(back, artifact);
        assert_eq!(back.procs[0].source_info.first().map(|x| x.line), Some(3));
    }

    #[test]
    fn test_fingerprint_mismatch() {
        let mut artifact = sample();
        artifact.metadata.isa_fingerprint = "0000".into();
        let text = artifact.to_json().unwrap();
        match CompiledJson::from_json(&text) {
            Err(ArtifactError::FingerprintMismatch { expected, found }) => {
                assert_eq!(expected, compute_isa_fingerprint());
                assert_eq!(found, "0000");
            }
            x => panic!("{x:?}"),
        }
    }

    #[test]
    fn test_bad_bytecode() {
        let mut artifact = sample();
        artifact.procs[0].bytecode = "not base64!".into();
        assert!(matches!(artifact.procs[0].bytes(), Err(ArtifactError::Base64(_))));
        assert!(matches!(CompiledJson::from_json("{"), Err(ArtifactError::Json(_))));
    }
}
