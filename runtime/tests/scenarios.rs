//! End-to-end scenarios: full programs run against an in-process recording
//! monitor.
//!

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use intendant_proto::{
    InvokeRequest, InvokeResponse, RegisterResourceOutputsRequest, RegisterResourceRequest,
    RegisterResourceResponse,
};
use intendant_runtime::{
    run_with_monitor, MonitorError, ResourceMonitor, RunInfo, SchemaCache,
};

/// Records every monitor call and answers with synthetic URNs/ids.
///
#[derive(Default)]
struct RecordingMonitor {
    registrations: Mutex<Vec<RegisterResourceRequest>>,
    outputs: Mutex<Vec<RegisterResourceOutputsRequest>>,
    invokes: Mutex<Vec<InvokeRequest>>,
    invoke_result: Mutex<Option<InvokeResponse>>,
}

impl RecordingMonitor {
    fn registrations(&self) -> Vec<RegisterResourceRequest> {
        self.registrations.lock().unwrap().clone()
    }

    fn outputs(&self) -> Vec<RegisterResourceOutputsRequest> {
        self.outputs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResourceMonitor for RecordingMonitor {
    async fn register_resource(
        &self,
        req: RegisterResourceRequest,
    ) -> Result<RegisterResourceResponse, MonitorError> {
        let urn = format!("urn:{}::{}", req.r#type, req.name);
        let id = format!("id-{}", req.name);
        self.registrations.lock().unwrap().push(req);
        Ok(RegisterResourceResponse {
            urn,
            id,
            object: Some(Default::default()),
        })
    }

    async fn register_resource_outputs(
        &self,
        req: RegisterResourceOutputsRequest,
    ) -> Result<(), MonitorError> {
        self.outputs.lock().unwrap().push(req);
        Ok(())
    }

    async fn invoke(&self, req: InvokeRequest) -> Result<InvokeResponse, MonitorError> {
        self.invokes.lock().unwrap().push(req);
        Ok(self
            .invoke_result
            .lock()
            .unwrap()
            .take()
            .unwrap_or_default())
    }
}

const TEST_SCHEMA: &str = r#"{
    "name": "pkg",
    "resources": {
        "pkg:m:R": {
            "inputProperties": {
                "x": {"type": "number"},
                "n": {"type": "string"}
            },
            "properties": {
                "foo": {"type": "number"}
            }
        }
    },
    "functions": {
        "pkg:m:getThing": {
            "inputs": {
                "type": "object",
                "properties": {"name": {"type": "string"}}
            },
            "outputs": {
                "type": "object",
                "properties": {"arn": {"type": "string"}}
            }
        }
    }
}"#;

fn schema_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let mut f = std::fs::File::create(dir.path().join("pkg.json")).unwrap();
    f.write_all(TEST_SCHEMA.as_bytes()).unwrap();
    dir
}

fn info() -> RunInfo {
    RunInfo {
        project: "proj".to_string(),
        stack: "dev".to_string(),
        monitor_addr: "in-process".to_string(),
        engine_addr: "in-process".to_string(),
        ..RunInfo::default()
    }
}

fn sources(src: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("main.pp".to_string(), src.to_string())])
}

fn string_field(s: &prost_types::Struct, key: &str) -> Option<String> {
    match s.fields.get(key)?.kind.as_ref()? {
        prost_types::value::Kind::StringValue(v) => Some(v.clone()),
        _ => None,
    }
}

#[tokio::test]
async fn test_empty_stack() {
    let monitor = Arc::new(RecordingMonitor::default());
    let (_, diags) = run_with_monitor(
        CancellationToken::new(),
        sources(""),
        info(),
        monitor.clone(),
        SchemaCache::new(),
    )
    .await;

    assert!(diags.is_empty(), "{diags:?}");

    let regs = monitor.registrations();
    assert_eq!(regs.len(), 1);
    assert_eq!(regs[0].r#type, "pulumi:pulumi:Stack");
    assert_eq!(regs[0].name, "proj-dev");
    assert!(!regs[0].custom);

    let outs = monitor.outputs();
    assert_eq!(outs.len(), 1);
    assert!(outs[0].outputs.as_ref().unwrap().fields.is_empty());
}

#[tokio::test]
async fn test_local_output_roundtrip() {
    let monitor = Arc::new(RecordingMonitor::default());
    let (_, diags) = run_with_monitor(
        CancellationToken::new(),
        sources(
            r#"
            greeting = "hello, ${name}"
            name     = "world"
            outputs {
                message = greeting
            }
            "#,
        ),
        info(),
        monitor.clone(),
        SchemaCache::new(),
    )
    .await;

    assert!(diags.is_empty(), "{diags:?}");

    let outs = monitor.outputs();
    assert_eq!(outs.len(), 1);
    let outputs = outs[0].outputs.as_ref().unwrap();
    assert_eq!(
        string_field(outputs, "message").as_deref(),
        Some("hello, world")
    );
}

#[tokio::test]
async fn test_resource_dependencies_on_the_wire() {
    let dir = schema_dir();
    let monitor = Arc::new(RecordingMonitor::default());
    let (_, diags) = run_with_monitor(
        CancellationToken::new(),
        sources(
            r#"
            resource "a" "pkg:m:R" {
                x = 1
            }
            resource "b" "pkg:m:R" {
                x = a.foo
            }
            "#,
        ),
        info(),
        monitor.clone(),
        SchemaCache::with_dir(dir.path()),
    )
    .await;

    assert!(!diags.has_errors(), "{diags:?}");

    let regs = monitor.registrations();
    assert_eq!(regs.len(), 3); // stack + a + b

    let a = regs.iter().find(|r| r.name == "a").unwrap();
    let b = regs.iter().find(|r| r.name == "b").unwrap();
    let a_urn = "urn:pkg:m:R::a".to_string();

    assert!(a.dependencies.is_empty());
    assert_eq!(b.dependencies, vec![a_urn.clone()]);
    assert_eq!(b.property_dependencies.get("x").unwrap().urns, vec![a_urn]);

    // Both parented to the stack.
    //
    assert_eq!(a.parent, "urn:pulumi:pulumi:Stack::proj-dev");
    assert_eq!(b.parent, a.parent);

    // b registered strictly after a.
    //
    let pos_a = regs.iter().position(|r| r.name == "a").unwrap();
    let pos_b = regs.iter().position(|r| r.name == "b").unwrap();
    assert!(pos_a < pos_b);
}

#[tokio::test]
async fn test_range_over_list() {
    let dir = schema_dir();
    let monitor = Arc::new(RecordingMonitor::default());
    let (_, diags) = run_with_monitor(
        CancellationToken::new(),
        sources(
            r#"
            resource "items" "pkg:m:R" {
                options {
                    range = ["a", "b", "c"]
                }
                n = range.value
            }
            "#,
        ),
        info(),
        monitor.clone(),
        SchemaCache::with_dir(dir.path()),
    )
    .await;

    assert!(!diags.has_errors(), "{diags:?}");

    let regs = monitor.registrations();
    let mut names: Vec<&str> = regs
        .iter()
        .filter(|r| r.r#type == "pkg:m:R")
        .map(|r| r.name.as_str())
        .collect();
    names.sort();
    assert_eq!(names, vec!["items-0", "items-1", "items-2"]);

    // Each iteration decoded its own range value.
    //
    for (name, expected) in [("items-0", "a"), ("items-1", "b"), ("items-2", "c")] {
        let reg = regs.iter().find(|r| r.name == name).unwrap();
        let object = reg.object.as_ref().unwrap();
        assert_eq!(string_field(object, "n").as_deref(), Some(expected));
    }
}

#[tokio::test]
async fn test_zero_range_registers_nothing() {
    let dir = schema_dir();
    let monitor = Arc::new(RecordingMonitor::default());
    let (_, diags) = run_with_monitor(
        CancellationToken::new(),
        sources(
            r#"
            resource "items" "pkg:m:R" {
                options {
                    range = 0
                }
                n = "never"
            }
            "#,
        ),
        info(),
        monitor.clone(),
        SchemaCache::with_dir(dir.path()),
    )
    .await;

    assert!(!diags.has_errors(), "{diags:?}");
    let regs = monitor.registrations();
    assert_eq!(regs.len(), 1); // just the stack
}

#[tokio::test]
async fn test_unknown_range_degrades_to_one_placeholder() {
    let dir = schema_dir();
    let monitor = Arc::new(RecordingMonitor::default());
    let mut run_info = info();
    run_info.dry_run = true;

    // During a dry run, "a"'s undeclared outputs come back unknown, so
    // "b"'s range expression is unknown.
    //
    let (_, diags) = run_with_monitor(
        CancellationToken::new(),
        sources(
            r#"
            resource "a" "pkg:m:R" {
                x = 1
            }
            resource "b" "pkg:m:R" {
                options {
                    range = a.foo
                }
                x = 2
            }
            "#,
        ),
        run_info,
        monitor.clone(),
        SchemaCache::with_dir(dir.path()),
    )
    .await;

    assert!(!diags.has_errors(), "{diags:?}");

    let regs = monitor.registrations();
    let b_regs: Vec<_> = regs.iter().filter(|r| r.name.starts_with("b-")).collect();
    assert_eq!(b_regs.len(), 1);
    assert_eq!(b_regs[0].name, "b-0");
}

#[tokio::test]
async fn test_missing_required_config() {
    let monitor = Arc::new(RecordingMonitor::default());
    let (_, diags) = run_with_monitor(
        CancellationToken::new(),
        sources(
            r#"
            config {
                string "region" {}
            }
            "#,
        ),
        info(),
        monitor.clone(),
        SchemaCache::new(),
    )
    .await;

    assert!(diags.has_errors());
    assert!(diags
        .iter()
        .any(|d| d.summary.contains("missing required config variable region")));

    // The stack still registered.
    //
    assert_eq!(monitor.registrations().len(), 1);
}

#[tokio::test]
async fn test_config_values_decode_as_json() {
    let monitor = Arc::new(RecordingMonitor::default());
    let mut run_info = info();
    run_info.config = BTreeMap::from([
        ("proj:region".to_string(), "\"eu-west-1\"".to_string()),
        ("proj:count".to_string(), "3".to_string()),
    ]);

    let (_, diags) = run_with_monitor(
        CancellationToken::new(),
        sources(
            r#"
            config {
                string "region" {}
                number "count" {
                    default = 1
                }
            }
            outputs {
                where    = region
                how_many = count
            }
            "#,
        ),
        run_info,
        monitor.clone(),
        SchemaCache::new(),
    )
    .await;

    assert!(diags.is_empty(), "{diags:?}");

    let outs = monitor.outputs();
    let outputs = outs[0].outputs.as_ref().unwrap();
    assert_eq!(string_field(outputs, "where").as_deref(), Some("eu-west-1"));
    match outputs.fields.get("how_many").unwrap().kind.as_ref().unwrap() {
        prost_types::value::Kind::NumberValue(n) => assert_eq!(*n, 3.0),
        other => panic!("how_many marshalled as {other:?}"),
    }
}

#[tokio::test]
async fn test_invoke_roundtrip() {
    let dir = schema_dir();
    let monitor = Arc::new(RecordingMonitor::default());
    *monitor.invoke_result.lock().unwrap() = Some(InvokeResponse {
        r#return: Some(prost_types::Struct {
            fields: std::collections::BTreeMap::from([(
                "arn".to_string(),
                prost_types::Value {
                    kind: Some(prost_types::value::Kind::StringValue("A".to_string())),
                },
            )]),
        }),
        failures: vec![],
    });

    let (_, diags) = run_with_monitor(
        CancellationToken::new(),
        sources(
            r#"
            thing = invoke("pkg:m:getThing", { name = "x" })
            outputs {
                arn = thing.arn
            }
            "#,
        ),
        info(),
        monitor.clone(),
        SchemaCache::with_dir(dir.path()),
    )
    .await;

    assert!(diags.is_empty(), "{diags:?}");

    let invokes = monitor.invokes.lock().unwrap();
    assert_eq!(invokes.len(), 1);
    assert_eq!(invokes[0].tok, "pkg:m:getThing");

    let outs = monitor.outputs();
    let outputs = outs[0].outputs.as_ref().unwrap();
    assert_eq!(string_field(outputs, "arn").as_deref(), Some("A"));
}

#[tokio::test]
async fn test_func_defines_a_scope_function() {
    let monitor = Arc::new(RecordingMonitor::default());
    let (_, diags) = run_with_monitor(
        CancellationToken::new(),
        sources(
            r#"
            double = func("a", "a * 2")
            four   = double(2)
            outputs {
                result = four
            }
            "#,
        ),
        info(),
        monitor.clone(),
        SchemaCache::new(),
    )
    .await;

    assert!(diags.is_empty(), "{diags:?}");

    let outs = monitor.outputs();
    let outputs = outs[0].outputs.as_ref().unwrap();
    match outputs.fields.get("result").unwrap().kind.as_ref().unwrap() {
        prost_types::value::Kind::NumberValue(n) => assert_eq!(*n, 4.0),
        other => panic!("result marshalled as {other:?}"),
    }
}

#[tokio::test]
async fn test_cancellation_registers_nothing() {
    let cancel = CancellationToken::new();
    cancel.cancel();

    let monitor = Arc::new(RecordingMonitor::default());
    let run = run_with_monitor(
        cancel,
        sources(
            r#"
            a = 1
            b = a + 1
            "#,
        ),
        info(),
        monitor.clone(),
        SchemaCache::new(),
    );

    // Must terminate promptly, without registering anything.
    //
    let (_, _diags) = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("cancelled run must not hang");

    assert!(monitor.registrations().is_empty());
    assert!(monitor.outputs().is_empty());
}

#[tokio::test]
async fn test_dependency_cycle_is_a_diagnostic() {
    let monitor = Arc::new(RecordingMonitor::default());
    let run = run_with_monitor(
        CancellationToken::new(),
        sources("a = b\nb = a\n"),
        info(),
        monitor.clone(),
        SchemaCache::new(),
    );

    let (_, diags) = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("cyclic program must not deadlock");

    assert!(diags.has_errors());
    assert!(diags.iter().any(|d| d.summary.contains("cycle")));
    assert!(monitor.registrations().is_empty());
}

#[tokio::test]
async fn test_evaluation_error_does_not_stop_other_nodes() {
    let dir = schema_dir();
    let monitor = Arc::new(RecordingMonitor::default());
    let (_, diags) = run_with_monitor(
        CancellationToken::new(),
        sources(
            r#"
            bad = 1 / 0
            resource "ok" "pkg:m:R" {
                x = 1
            }
            "#,
        ),
        info(),
        monitor.clone(),
        SchemaCache::with_dir(dir.path()),
    )
    .await;

    // The failing local is reported, the unrelated resource still lands.
    //
    assert!(diags.has_errors());
    assert!(monitor.registrations().iter().any(|r| r.name == "ok"));
}
