use std::fs;
use std::path::PathBuf;

use crate::error::PreprocessError;
use crate::preprocessor::*;
use crate::token::{Token, TokenKind};

fn preprocess_with(settings: PreprocessorSettings, src: &str) -> Result<PreprocessOutput, PreprocessError> {
    let mut preprocessor = Preprocessor::new(settings);
    preprocessor.push_source("main.dm", src);
    preprocessor.run()
}
fn preprocess(src: &str) -> PreprocessOutput {
    preprocess_with(Default::default(), src).unwrap()
}
fn significant(tokens: &[Token]) -> Vec<&Token> {
    tokens.iter().filter(|x| !matches!(x.kind, TokenKind::Whitespace | TokenKind::Newline)).collect()
}
fn texts(tokens: &[Token]) -> Vec<&str> {
    significant(tokens).into_iter().map(|x| x.text.as_str()).collect()
}

/// A fresh directory under the system temp dir, removed again on drop.
struct TempDir(PathBuf);
impl TempDir {
    fn new(name: &str) -> Self {
        let path = std::env::temp_dir().join(format!("dm-bytecode-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&path);
        fs::create_dir_all(&path).unwrap();
        Self(path)
    }
    fn write(&self, file: &str, content: &str) {
        let path = self.0.join(file);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
}
impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.0);
    }
}

#[test]
fn test_macro_uses_invocation_location() {
    let output = preprocess("#define FOO 1+1\nvar/x = FOO\n");
    let tokens = significant(&output.tokens);
    let expanded = &tokens[tokens.len() - 3..];
    assert_eq!(expanded.iter().map(|x| x.text.as_str()).collect::<Vec<_>>(), ["1", "+", "1"]);
    for token in expanded {
        assert_eq!(&*token.location.file, "main.dm");
        assert_eq!(token.location.line, 2);
        assert_eq!(token.location.column, 9);
    }
}

#[test]
fn test_macro_overflow_parameter() {
    let src = "#define LOG(fmt, args...) fmt args\n";
    assert_eq!(texts(&preprocess(&format!("{src}LOG(\"x\")\n")).tokens), ["\"x\""]);
    assert_eq!(texts(&preprocess(&format!("{src}LOG(\"x\", 1)\n")).tokens), ["\"x\"", "1"]);
    assert_eq!(texts(&preprocess(&format!("{src}LOG(\"x\", 1, 2, 3)\n")).tokens), ["\"x\"", "1", ",", "2", ",", "3"]);

    let src = "#define ALL(...) [__VA_ARGS__]\nALL(a, (b, c))\n";
    assert_eq!(texts(&preprocess(src).tokens), ["[", "a", ",", "(", "b", ",", "c", ")", "]"]);

    // arguments are only glued onto what precedes them through ##
    let src = "#define J(a, rest...) a/**/rest\nJ(x, y)\n";
    assert_eq!(texts(&preprocess(src).tokens), ["x", "y"]);
    let src = "#define J(a, b) a/**/b\nJ(x, y)\n";
    assert_eq!(texts(&preprocess(src).tokens), ["x", "y"]);
    let src = "#define CAT(a, rest...) a##rest\nCAT(x, y)\n";
    assert_eq!(texts(&preprocess(src).tokens), ["xy"]);
}

#[test]
fn test_macro_arity() {
    match preprocess_with(Default::default(), "#define TWO(a, b) a b\nTWO(1)\n") {
        Err(PreprocessError::MacroArity { name, expected, given, location }) => {
            assert_eq!(name, "TWO");
            assert_eq!((expected, given), (2, 1));
            assert_eq!(location.line, 2);
        }
        x => panic!("{x:?}"),
    }
}

#[test]
fn test_macro_without_call_is_literal() {
    let output = preprocess("#define F(x) x * 2\nF + F(3)\n");
    assert_eq!(texts(&output.tokens), ["F", "+", "3", "*", "2"]);

    // a parameterless macro copies a following argument list through
    let output = preprocess("#define G 7\nG(1)\n");
    assert_eq!(texts(&output.tokens), ["7", "(", "1", ")"]);
}

#[test]
fn test_stringify_and_paste() {
    let output = preprocess("#define STR(x) #x\nSTR(a+b)\n");
    let tokens = significant(&output.tokens);
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].kind, TokenKind::ConstantString);
    assert_eq!(tokens[0].text, "\"a+b\"");
    assert_eq!(tokens[0].value.as_deref(), Some("a+b"));

    let output = preprocess("#define GLUE(a, b) a##b\nGLUE(foo, bar)\n");
    assert_eq!(texts(&output.tokens), ["foobar"]);
}

#[test]
fn test_builtin_macros() {
    let output = preprocess("\n\n__LINE__ __FILE__ DM_VERSION\n");
    assert_eq!(texts(&output.tokens), ["3", "\"main.dm\"", "515"]);

    let mut preprocessor = Preprocessor::new(Default::default());
    preprocessor.define_macro("DEBUG", "2 + 3").unwrap();
    assert!(preprocessor.is_defined("DEBUG"));
    preprocessor.push_source("main.dm", "DEBUG\n");
    assert_eq!(texts(&preprocessor.run().unwrap().tokens), ["2", "+", "3"]);
}

#[test]
fn test_conditionals() {
    let src = r#"
#define A
#ifdef A
yes_a
#else
no_a
#endif
#ifndef B
no_b
#endif
#if defined(A) && 2 > 1
expr_true
#elif 1
elif_wrong
#else
else_wrong
#endif
#if 0
zero
#elif defined B
elif_b
#else
fallback
#endif
#if 1
#if 0
inner
#endif
outer
#endif
"#;
    assert_eq!(texts(&preprocess(src).tokens), ["yes_a", "no_b", "expr_true", "fallback", "outer"]);
}

#[test]
fn test_conditional_errors() {
    match preprocess_with(Default::default(), "#if 1\nx\n") {
        Err(PreprocessError::Directive { message, .. }) => assert_eq!(message, "missing 1 #endif directive"),
        x => panic!("{x:?}"),
    }
    assert!(matches!(preprocess_with(Default::default(), "#endif\n"), Err(PreprocessError::Directive { .. })));
    assert!(matches!(preprocess_with(Default::default(), "#else\n"), Err(PreprocessError::Directive { .. })));
    match preprocess_with(Default::default(), "#error stop here\n") {
        Err(PreprocessError::ErrorDirective { message, .. }) => assert_eq!(message, "stop here"),
        x => panic!("{x:?}"),
    }
}

#[test]
fn test_warnings() {
    let output = preprocess("#undef NOPE\n#warn careful\nok\n");
    assert_eq!(texts(&output.tokens), ["ok"]);
    assert_eq!(output.warnings.len(), 2);
    assert!(output.warnings[0].message.contains("NOPE"));
    assert_eq!(output.warnings[1].message, "careful");
    assert_eq!(output.warnings[1].location.line, 2);
}

#[test]
fn test_expansion_overflow() {
    match preprocess_with(Default::default(), "#define LOOP LOOP\nLOOP\n") {
        Err(PreprocessError::ExpansionOverflow { name, limit, .. }) => {
            assert_eq!(name, "LOOP");
            assert_eq!(limit, 128);
        }
        x => panic!("{x:?}"),
    }

    let settings = PreprocessorSettings { max_expansion_depth: 2, ..Default::default() };
    assert!(preprocess_with(settings.clone(), "#define A B\n#define B 1\nA\n").is_ok());
    let err = preprocess_with(settings, "#define A B\n#define B C\n#define C 1\nA\n").unwrap_err();
    assert!(matches!(err, PreprocessError::ExpansionOverflow { limit: 2, .. }));
}

#[test]
fn test_includes() {
    let dir = TempDir::new("includes");
    dir.write("main.dme", "#include \"code/a.dm\"\n#include \"maps/map.dmm\"\n#include \"ui.dmf\"\n#include \"code/a.dm\"\nfinal\n");
    dir.write("code/a.dm", "#include \"b.dm\"\nfrom_a\n");
    dir.write("code/b.dm", "from_b\n");
    dir.write("maps/map.dmm", "");
    dir.write("ui.dmf", "");

    let output = expand(&dir.0, "main.dme").unwrap();
    assert_eq!(texts(&output.tokens), ["from_b", "from_a", "final"]);
    assert_eq!(output.included_maps, [dir.0.join("maps/map.dmm")]);
    assert_eq!(output.included_interface, Some(dir.0.join("ui.dmf")));
    assert_eq!(output.warnings.len(), 1);
    assert!(output.warnings[0].message.contains("already included"));

    let from_b = significant(&output.tokens)[0];
    assert_eq!(&*from_b.location.file, "code/b.dm");
    assert_eq!(from_b.location.line, 1);
}

#[test]
fn test_include_errors() {
    let dir = TempDir::new("include-errors");
    dir.write("two_ui.dme", "#include \"a.dmf\"\n#include \"b.dmf\"\n");
    dir.write("a.dmf", "");
    dir.write("b.dmf", "");
    dir.write("script.dme", "#include \"run.dms\"\n");
    dir.write("run.dms", "");
    dir.write("missing.dme", "#include \"nowhere.dm\"\n");

    for entry in ["two_ui.dme", "script.dme", "missing.dme"] {
        match expand(&dir.0, entry) {
            Err(PreprocessError::Include { location, .. }) => assert_eq!(location.line, if entry == "two_ui.dme" { 2 } else { 1 }),
            x => panic!("{entry}: {x:?}"),
        }
    }
}
