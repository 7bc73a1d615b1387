use std::fs;
use std::fmt::{self, Write as FmtWrite};
use std::io::{self, Write as IoWrite, BufWriter};
use std::path::{Path, PathBuf};
use std::collections::BTreeMap;

use clap::Parser;
use tracing::info;

use crate::annotated::AnnotatedItem;
use crate::artifact::CompiledJson;
use crate::bytecode::dump_code;
use crate::cfg::build_cfg;
use crate::opcode::{compute_isa_fingerprint, verify_isa, Opcode};
use crate::optimizer::{optimize_cfg, OptimizerSettings};
use crate::peephole::peephole;
use crate::preprocessor::Preprocessor;

macro_rules! crash {
    ($ret:literal : $($tt:tt)*) => {{
        eprintln!($($tt)*);
        std::process::exit($ret);
    }}
}

/// Tools for inspecting compiled DM artifacts and running the compiler's front and back end stages
#[derive(Parser, Debug)]
pub enum Mode {
    /// Lists every type path in a compiled artifact
    Types {
        /// Path to the (json) compiled artifact
        src: String,
        /// Only list types whose path contains this text
        #[clap(long)]
        search: Option<String>,
    },
    /// Lists the procs visible on a type
    Procs {
        /// Path to the (json) compiled artifact
        src: String,
        /// The type path, such as /mob
        path: String,
    },
    /// Prints the disassembly of a single proc
    Decompile {
        /// Path to the (json) compiled artifact
        src: String,
        /// The type path, such as /mob
        path: String,
        /// The proc name, or <init> / <global_init>
        name: String,
        /// Print a hex dump alongside each instruction
        #[clap(long)]
        hex: bool,
    },
    /// Disassembles every proc and reports the ones that fail to decode
    VerifyAll {
        /// Path to the (json) compiled artifact
        src: String,
    },
    /// Writes the disassembly of every proc to a single file
    DumpAll {
        /// Path to the (json) compiled artifact
        src: String,
        /// The output file (default: the artifact path with a .dmd extension)
        #[clap(long)]
        output: Option<String>,
    },
    /// Counts how often each opcode occurs across every proc
    OpcodeCount {
        /// Path to the (json) compiled artifact
        src: String,
    },
    /// Prints the fingerprint of this build's opcode table
    Fingerprint,
    /// Preprocesses a DM source file and prints the resulting source
    Preprocess {
        /// Path to the (dm/dme) source file
        src: String,
        /// Directory that includes are resolved against (default: the directory of the source file)
        #[clap(long)]
        include_dir: Option<String>,
        /// Defines a macro, as NAME or NAME=VALUE (may be repeated)
        #[clap(long)]
        define: Vec<String>,
        /// Print one token per line with its kind and location
        #[clap(long)]
        tokens: bool,
    },
    /// Optimizes a procedure given as a json array of annotated items
    Optimize {
        /// Path to the (json) annotated procedure
        src: String,
        /// Print the control flow graph after optimization instead of the items
        #[clap(long)]
        dump_cfg: bool,
        /// Skip the peephole rewrites
        #[clap(long)]
        no_peephole: bool,
    },
}

fn read_file(path: &str) -> String {
    match fs::read_to_string(path) {
        Ok(x) => x,
        Err(e) => crash!(1: "failed to open '{path}' for reading:\n{e:?}"),
    }
}
fn load_artifact(path: &str) -> CompiledJson {
    match CompiledJson::load(Path::new(path)) {
        Ok(x) => x,
        Err(e) => crash!(2: "failed to load '{path}':\n{e}"),
    }
}
fn type_id(artifact: &CompiledJson, path: &str) -> usize {
    match artifact.type_id(path) {
        Ok(x) => x,
        Err(e) => crash!(3: "{e}"),
    }
}

/// Disassembles every proc into one listing, each headed by its path.
/// Also returns the paths of the procs that failed to decode, which are left out of the listing.
fn dump_all(artifact: &CompiledJson) -> Result<(String, Vec<String>), fmt::Error> {
    let strings = artifact.string_table();
    let mut res = String::new();
    let mut failed = vec![];
    for proc in artifact.procs.iter() {
        match proc.disassemble(&strings) {
            Ok(listing) if listing.is_ok() => writeln!(res, "{}:\n{listing}", artifact.proc_path(proc))?,
            _ => failed.push(artifact.proc_path(proc)),
        }
    }
    Ok((res, failed))
}

/// Runs the CLI in the given mode. Every failure terminates the process with a nonzero exit code.
pub fn run(mode: Mode) {
    if let Err(e) = verify_isa() {
        crash!(100: "opcode table is inconsistent: {e}");
    }

    match mode {
        Mode::Types { src, search } => {
            let artifact = load_artifact(&src);
            for ty in artifact.types.iter() {
                if search.as_deref().map_or(true, |s| ty.path.contains(s)) {
                    println!("{}", ty.path);
                }
            }
        }
        Mode::Procs { src, path } => {
            let artifact = load_artifact(&src);
            let id = type_id(&artifact, &path);
            for (_, proc) in artifact.procs_of(id) {
                println!("{}", proc.name);
            }
        }
        Mode::Decompile { src, path, name, hex } => {
            let artifact = load_artifact(&src);
            let strings = artifact.string_table();
            let proc = match artifact.find_proc(&path, &name) {
                Ok(x) => x,
                Err(e) => crash!(3: "{e}"),
            };
            let code = match proc.bytes() {
                Ok(x) => x,
                Err(e) => crash!(4: "{}: {e}", artifact.proc_path(proc)),
            };
            if hex {
                let mut out = BufWriter::new(io::stdout().lock());
                if let Err(e) = dump_code(&code, &strings, &mut out).and_then(|_| out.flush()) {
                    crash!(1: "failed to write output: {e}");
                }
            } else {
                print!("{}", crate::bytecode::disassemble(&code, &strings));
            }
        }
        Mode::VerifyAll { src } => {
            let artifact = load_artifact(&src);
            let strings = artifact.string_table();
            let mut errored = 0;
            for proc in artifact.procs.iter() {
                match proc.disassemble(&strings) {
                    Ok(listing) if listing.is_ok() => (),
                    Ok(listing) => {
                        println!("Error disassembling {}", artifact.proc_path(proc));
                        print!("{listing}");
                        errored += 1;
                    }
                    Err(e) => {
                        println!("Error disassembling {}", artifact.proc_path(proc));
                        println!("{e}");
                        errored += 1;
                    }
                }
            }
            println!("Errors in {errored}/{} procs", artifact.procs.len());
            if errored > 0 {
                std::process::exit(1);
            }
        }
        Mode::DumpAll { src, output } => {
            let artifact = load_artifact(&src);
            let output = output.map(PathBuf::from).unwrap_or_else(|| Path::new(&src).with_extension("dmd"));

            let (res, failed) = match dump_all(&artifact) {
                Ok(x) => x,
                Err(e) => crash!(1: "failed to format the listing:\n{e:?}"),
            };
            for path in failed.iter() {
                println!("Error disassembling {path}");
            }
            let errored = failed.len();
            if let Err(e) = fs::write(&output, res) {
                crash!(1: "failed to write '{}':\n{e:?}", output.display());
            }

            let all = artifact.procs.len();
            match errored {
                0 => println!("Successfully dumped all {all} procs to {}", output.display()),
                _ => println!("Successfully dumped {}/{all} ({errored} failed procs) procs to {}", all - errored, output.display()),
            }
        }
        Mode::OpcodeCount { src } => {
            let artifact = load_artifact(&src);
            let strings = artifact.string_table();
            let mut counts: BTreeMap<&'static str, usize> = Opcode::all().map(|x| (x.name(), 0)).collect();
            for proc in artifact.procs.iter() {
                let Ok(listing) = proc.disassemble(&strings) else { continue };
                for (_, ins) in listing.instructions.iter() {
                    *counts.entry(ins.opcode.name()).or_default() += 1;
                }
            }

            let mut counts = counts.into_iter().collect::<Vec<_>>();
            counts.sort_by(|a, b| b.1.cmp(&a.1));
            println!("Opcode: Count");
            for (name, count) in counts {
                println!("{name}: {count}");
            }
        }
        Mode::Fingerprint => println!("{}", compute_isa_fingerprint()),
        Mode::Preprocess { src, include_dir, define, tokens } => {
            let src_path = Path::new(&src);
            let include_dir = match include_dir {
                Some(x) => PathBuf::from(x),
                None => src_path.parent().map(Path::to_owned).unwrap_or_default(),
            };
            let file = src_path.file_name().map(|x| x.to_string_lossy().into_owned()).unwrap_or_else(|| src.clone());

            let mut preprocessor = Preprocessor::new(Default::default());
            for def in define.iter() {
                let (name, value) = def.split_once('=').unwrap_or((def.as_str(), ""));
                if let Err(e) = preprocessor.define_macro(name, value) {
                    crash!(2: "bad define '{def}':\n{e}");
                }
            }
            if let Err(e) = preprocessor.include_file(&include_dir, &file) {
                crash!(1: "{e}");
            }
            let output = match preprocessor.run() {
                Ok(x) => x,
                Err(e) => crash!(3: "{e}"),
            };

            for warning in output.warnings.iter() {
                eprintln!("{warning}");
            }
            if tokens {
                for token in output.tokens.iter() {
                    println!("{}\t{:?}\t{:?}", token.location, token.kind, token.text);
                }
            } else {
                let text = output.tokens.iter().fold(String::new(), |mut acc, x| { acc.push_str(&x.text); acc });
                println!("{text}");
            }
        }
        Mode::Optimize { src, dump_cfg, no_peephole } => {
            let items: Vec<AnnotatedItem> = match serde_json::from_str(&read_file(&src)) {
                Ok(x) => x,
                Err(e) => crash!(2: "failed to parse '{src}' as annotated items:\n{e}"),
            };
            let before = items.len();
            let mut cfg = match build_cfg(items) {
                Ok(x) => x,
                Err(e) => crash!(3: "{e}"),
            };
            let stats = match optimize_cfg(&mut cfg, &OptimizerSettings::default()) {
                Ok(x) => x,
                Err(e) => crash!(4: "{e}"),
            };
            info!(?stats, "optimized");

            if dump_cfg {
                let mut res = String::new();
                if let Err(e) = cfg.dump(&mut res) {
                    crash!(1: "failed to format the control flow graph:\n{e:?}");
                }
                print!("{res}");
            } else {
                let mut items = cfg.into_items();
                if !no_peephole {
                    let stats = peephole(&mut items);
                    info!(?stats, "peephole");
                }
                eprintln!("{before} items -> {} items", items.len());
                for item in items.iter() {
                    match item {
                        AnnotatedItem::Label(_) => println!("{item}"),
                        _ => println!("\t{item}"),
                    }
                }
            }
        }
    }
}

#[test]
fn test_dump_all() {
    use crate::annotated::{Instruction, Operand};
    use crate::artifact::ArtifactBuilder;

    let mut builder = ArtifactBuilder::new();
    let mob = builder.add_type("/mob", None);
    let items: Vec<AnnotatedItem> = vec![
        Instruction::new(Opcode::PushFloat, vec![Operand::Float(1.0)]).unwrap().into(),
        Instruction::simple(Opcode::Return).unwrap().into(),
    ];
    for name in ["act", "idle"] {
        let encoded = builder.encode(&items).unwrap();
        builder.add_proc(mob, name, &[], encoded);
    }
    let mut artifact = builder.finish();

    let (listing, failed) = dump_all(&artifact).unwrap();
    assert_eq!(listing, "/mob/proc/act():\n\tPushFloat 1.0\n\tReturn\n\n/mob/proc/idle():\n\tPushFloat 1.0\n\tReturn\n\n");
    assert!(failed.is_empty());

    artifact.procs[0].bytecode = "not base64!".into();
    let (listing, failed) = dump_all(&artifact).unwrap();
    assert_eq!(listing, "/mob/proc/idle():\n\tPushFloat 1.0\n\tReturn\n\n");
    assert_eq!(failed, ["/mob/proc/act()"]);
}
