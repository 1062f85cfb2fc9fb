//! Tests for the expression language: parsing, evaluation, helper
//! functions, coercions, and safe-default failure semantics.

use serde_json::{Value, json};

use proctor_engine::expr::{CompiledExpr, EvalInput};
use proctor_engine::types::{Issue, IssueCounts, PrInfo, Severity};
use proctor_memory::MemoryStore;

fn pr_fixture() -> PrInfo {
    PrInfo {
        number: Some(42),
        title: "Add journal".to_string(),
        author: "mallory".to_string(),
        author_association: "MEMBER".to_string(),
        author_permission: Some("write".to_string()),
        files: vec!["src/lib.rs".to_string(), "docs/readme.md".to_string()],
        ..PrInfo::default()
    }
}

fn input_with<'a>(
    output: Value,
    outputs: Value,
    metadata: IssueCounts,
    pr: &'a PrInfo,
    memory: Option<&'a MemoryStore>,
) -> EvalInput<'a> {
    EvalInput::new(output, outputs, metadata, json!({}), pr, memory)
}

fn eval(source: &str, input: &EvalInput<'_>) -> Value {
    CompiledExpr::compile(source)
        .expect("compiles")
        .evaluate(input)
        .expect("evaluates")
}

#[test]
fn literals_and_arithmetic() {
    let pr = PrInfo::default();
    let input = input_with(Value::Null, json!({}), IssueCounts::default(), &pr, None);

    assert_eq!(eval("1 + 2 * 3", &input), json!(7));
    assert_eq!(eval("(1 + 2) * 3", &input), json!(9));
    assert_eq!(eval("10 % 3", &input), json!(1));
    assert_eq!(eval("-4 + 1", &input), json!(-3));
    assert_eq!(eval("1.5 + 1.5", &input), json!(3));
    assert_eq!(eval("'a' + 'b'", &input), json!("ab"));
    assert_eq!(eval("'n=' + 3", &input), json!("n=3"));
}

#[test]
fn comparisons_and_logic() {
    let pr = PrInfo::default();
    let input = input_with(Value::Null, json!({}), IssueCounts::default(), &pr, None);

    assert_eq!(eval("2 < 3 && 3 <= 3", &input), json!(true));
    assert_eq!(eval("2 > 3 || 'x' == 'x'", &input), json!(true));
    assert_eq!(eval("1 != 2", &input), json!(true));
    assert_eq!(eval("!false", &input), json!(true));
    assert_eq!(eval("'b' > 'a'", &input), json!(true));
    // Short-circuit: the right side would error if evaluated.
    assert_eq!(eval("false && unknownFn()", &input), json!(false));
}

#[test]
fn ternary_and_null() {
    let pr = PrInfo::default();
    let input = input_with(Value::Null, json!({"n": 2}), IssueCounts::default(), &pr, None);

    assert_eq!(eval("outputs.n < 3 ? 'again' : null", &input), json!("again"));
    assert_eq!(eval("outputs.n < 2 ? 'again' : null", &input), Value::Null);
}

#[test]
fn member_and_index_access() {
    let pr = PrInfo::default();
    let outputs = json!({
        "fetch": { "status": "ok", "items": [10, 20, 30] },
        "history": { "process": [1, 2, 3] },
    });
    let input = input_with(json!({"exitCode": 0}), outputs, IssueCounts::default(), &pr, None);

    assert_eq!(eval("output.exitCode == 0", &input), json!(true));
    assert_eq!(eval("outputs.fetch.status", &input), json!("ok"));
    assert_eq!(eval("outputs.fetch.items[1]", &input), json!(20));
    assert_eq!(eval("outputs['fetch']['status']", &input), json!("ok"));
    assert_eq!(eval("outputs.history['process'].length", &input), json!(3));
    assert_eq!(eval("length(outputs.history['process'])", &input), json!(3));
    // Missing members resolve to null, not errors.
    assert_eq!(eval("outputs.missing", &input), Value::Null);
    assert_eq!(eval("outputs.fetch.items[9]", &input), Value::Null);
}

#[test]
fn string_helpers() {
    let pr = PrInfo::default();
    let input = input_with(
        json!("hello world"),
        json!({"list": [1, 2]}),
        IssueCounts::default(),
        &pr,
        None,
    );

    assert_eq!(eval("contains(output, 'world')", &input), json!(true));
    assert_eq!(eval("contains(outputs.list, 2)", &input), json!(true));
    assert_eq!(eval("contains(outputs.list, 9)", &input), json!(false));
    assert_eq!(eval("startsWith(output, 'hello')", &input), json!(true));
    assert_eq!(eval("endsWith(output, 'planet')", &input), json!(false));
    assert_eq!(eval("length(output)", &input), json!(11));
}

#[test]
fn issue_helpers_use_metadata() {
    let pr = PrInfo::default();
    let issues = vec![
        Issue {
            file: None,
            line: None,
            severity: Severity::Critical,
            message: "overflow".to_string(),
            rule: None,
            suppressed: false,
        },
        Issue {
            file: None,
            line: None,
            severity: Severity::Warning,
            message: "style".to_string(),
            rule: None,
            suppressed: false,
        },
        Issue {
            file: None,
            line: None,
            severity: Severity::Critical,
            message: "suppressed".to_string(),
            rule: None,
            suppressed: true,
        },
    ];
    let metadata = IssueCounts::tally(&issues);
    let input = input_with(Value::Null, json!({}), metadata, &pr, None);

    assert_eq!(eval("hasIssue()", &input), json!(true));
    assert_eq!(eval("hasIssue('critical')", &input), json!(true));
    assert_eq!(eval("hasIssue('error')", &input), json!(false));
    // The suppressed critical is not counted.
    assert_eq!(eval("countIssues('critical')", &input), json!(1));
    assert_eq!(eval("countIssues()", &input), json!(2));
}

#[test]
fn pr_helpers() {
    let pr = pr_fixture();
    let input = input_with(Value::Null, json!({}), IssueCounts::default(), &pr, None);

    assert_eq!(eval("isOwner()", &input), json!(false));
    assert_eq!(eval("isMember()", &input), json!(true));
    assert_eq!(eval("hasMinPermission('write')", &input), json!(true));
    assert_eq!(eval("hasMinPermission('admin')", &input), json!(false));
    assert_eq!(eval("hasFileMatching('src/*.rs')", &input), json!(true));
    assert_eq!(eval("hasFileMatching('*.py')", &input), json!(false));
    assert_eq!(eval("pr.number == 42", &input), json!(true));
    assert_eq!(eval("pr.author", &input), json!("mallory"));
}

#[test]
fn memory_read_surface() {
    let pr = PrInfo::default();
    let store = MemoryStore::new();
    store.set("n", json!(3), None);
    store.set("flag", json!(true), Some("ns"));
    let input = input_with(Value::Null, json!({}), IssueCounts::default(), &pr, Some(&store));

    assert_eq!(eval("memory.get('n')", &input), json!(3));
    assert_eq!(eval("memory.get('n') < 3 ? 'counter' : null", &input), Value::Null);
    assert_eq!(eval("memory.get('flag', 'ns')", &input), json!(true));
    assert_eq!(eval("memory.has('missing')", &input), json!(false));
    assert_eq!(eval("contains(memory.list(), 'n')", &input), json!(true));

    // Mutating operations are not exposed to expressions.
    let compiled = CompiledExpr::compile("memory.set('n', 9)").expect("compiles");
    assert!(compiled.evaluate(&input).is_err());
}

#[test]
fn compile_errors_are_reported() {
    assert!(CompiledExpr::compile("").is_err());
    assert!(CompiledExpr::compile("1 +").is_err());
    assert!(CompiledExpr::compile("outputs..x").is_err());
    assert!(CompiledExpr::compile("'unterminated").is_err());
    let oversized = "1 + ".repeat(2000) + "1";
    assert!(CompiledExpr::compile(&oversized).is_err());
}

#[test]
fn role_wrappers_apply_safe_defaults() {
    let pr = PrInfo::default();
    let input = input_with(Value::Null, json!({}), IssueCounts::default(), &pr, None);

    // Unknown function: predicate defaults to false.
    let broken = CompiledExpr::compile("unknownFn(1)").expect("compiles");
    assert!(!broken.evaluate_bool(&input));

    // goto returning a non-string is ignored.
    let numeric = CompiledExpr::compile("1 + 1").expect("compiles");
    assert_eq!(numeric.evaluate_goto(&input), None);

    // Nullish goto means no jump.
    let nullish = CompiledExpr::compile("null").expect("compiles");
    assert_eq!(nullish.evaluate_goto(&input), None);

    let target = CompiledExpr::compile("'fetch'").expect("compiles");
    assert_eq!(target.evaluate_goto(&input), Some("fetch".to_string()));
}

#[test]
fn run_target_coercion() {
    let pr = PrInfo::default();
    let input = input_with(Value::Null, json!({}), IssueCounts::default(), &pr, None);

    let single = CompiledExpr::compile("'lint'").expect("compiles");
    let targets = single.evaluate_run_targets(&input);
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].target, "lint");
    assert!(targets[0].scope.is_none());

    let many = CompiledExpr::compile("['lint', 'test']").expect("compiles");
    assert_eq!(many.evaluate_run_targets(&input).len(), 2);

    // Malformed targets collapse to no-ops.
    let malformed = CompiledExpr::compile("42").expect("compiles");
    assert!(malformed.evaluate_run_targets(&input).is_empty());
}

#[test]
fn division_never_produces_non_finite_values() {
    let pr = PrInfo::default();
    let input = input_with(Value::Null, json!({}), IssueCounts::default(), &pr, None);

    let division = CompiledExpr::compile("1 / 0").expect("compiles");
    assert!(division.evaluate(&input).is_err());
    // As a predicate the error collapses to false.
    assert!(!division.evaluate_bool(&input));
}

#[test]
fn truthiness_matches_loose_semantics() {
    let pr = PrInfo::default();
    let input = input_with(
        Value::Null,
        json!({"zero": 0, "empty": "", "list": []}),
        IssueCounts::default(),
        &pr,
        None,
    );

    assert_eq!(eval("!outputs.zero", &input), json!(true));
    assert_eq!(eval("!outputs.empty", &input), json!(true));
    assert_eq!(eval("!outputs.missing", &input), json!(true));
    // Empty arrays are truthy.
    assert_eq!(eval("!outputs.list", &input), json!(false));
}
