//! Structured logging of batch processing, captured with a test layer.

use std::rc::Rc;
use std::sync::{Arc, Mutex};

use projector_core::{ChangeEvent, EntityId, TypeDescriptor};
use projector_harness::MemoryRepository;
use projector_runtime::{EventFault, ProjectionConfig, ProjectionScope};
use serde_json::json;
use tracing::Subscriber;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Captured {
    level: tracing::Level,
    message: String,
    type_name: Option<String>,
}

#[derive(Default)]
struct ProjectionTraceCapture {
    events: Arc<Mutex<Vec<Captured>>>,
}

impl<S> Layer<S> for ProjectionTraceCapture
where
    S: Subscriber + for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        #[derive(Default)]
        struct Fields {
            message: Option<String>,
            type_name: Option<String>,
        }
        impl tracing::field::Visit for Fields {
            fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
                match field.name() {
                    "message" => self.message = Some(value.to_string()),
                    "type_name" => self.type_name = Some(value.to_string()),
                    _ => {}
                }
            }

            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                let text = format!("{value:?}").trim_matches('"').to_string();
                match field.name() {
                    "message" => self.message = Some(text),
                    "type_name" => self.type_name = Some(text),
                    _ => {}
                }
            }
        }

        let mut fields = Fields::default();
        event.record(&mut fields);
        let Some(message) = fields.message else {
            return;
        };
        if !message.starts_with("projection.") {
            return;
        }
        self.events.lock().expect("capture lock").push(Captured {
            level: *event.metadata().level(),
            message,
            type_name: fields.type_name,
        });
    }
}

fn capture() -> (Arc<Mutex<Vec<Captured>>>, tracing::subscriber::DefaultGuard) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let subscriber = tracing_subscriber::registry().with(ProjectionTraceCapture {
        events: Arc::clone(&events),
    });
    let guard = tracing::subscriber::set_default(subscriber);
    (events, guard)
}

fn mount(config: ProjectionConfig) -> (Rc<MemoryRepository>, ProjectionScope) {
    let types = vec![
        TypeDescriptor::collection("user"),
        TypeDescriptor::singleton("session"),
    ];
    let repo = Rc::new(
        types
            .iter()
            .cloned()
            .fold(MemoryRepository::new(), MemoryRepository::with_type)
            .with_type(TypeDescriptor::collection("audit")),
    );
    let scope = ProjectionScope::mount(repo.clone(), types, config).unwrap();
    (repo, scope)
}

#[test]
fn faulty_event_is_logged_and_isolated() {
    let (events, _guard) = capture();
    let (repo, scope) = mount(ProjectionConfig::default());

    repo.emit(vec![
        ChangeEvent::new("user", json!([{"id": 1}, {"missing": "id"}])),
        ChangeEvent::new("audit", json!([{"id": 1}])),
        ChangeEvent::new("session", json!({"token": "t"})),
        ChangeEvent::new("user", json!({"7": {"id": 7}})),
    ]);

    let users = scope.accessor("user").unwrap();
    assert_eq!(users.len(), 1);
    assert!(users.by_id(&EntityId::from(7)).is_some());
    assert!(scope.accessor("session").unwrap().single().is_some());

    let faults = scope.diagnostics().faults();
    assert_eq!(faults.len(), 1);
    assert!(matches!(
        &faults[0].fault,
        EventFault::MissingId { type_name, index: 1, .. } if type_name == "user"
    ));

    let captured = events.lock().expect("capture lock");
    let fault = captured
        .iter()
        .find(|e| e.message == "projection.event_fault")
        .expect("expected projection.event_fault");
    assert_eq!(fault.level, tracing::Level::WARN);
    assert_eq!(fault.type_name.as_deref(), Some("user"));
    assert!(
        captured
            .iter()
            .any(|e| e.message == "projection.batch" && e.level == tracing::Level::DEBUG)
    );
    assert!(captured.iter().any(|e| e.message == "projection.attach"));
}

#[test]
fn batch_logging_can_be_disabled() {
    let (events, _guard) = capture();
    let (repo, _scope) = mount(ProjectionConfig::default().with_log_batches(false));
    repo.emit(vec![ChangeEvent::new("user", json!([{"id": 1}]))]);
    let captured = events.lock().expect("capture lock");
    assert!(!captured.iter().any(|e| e.message == "projection.batch"));
}

#[test]
fn relation_fallback_is_logged() {
    let (events, _guard) = capture();
    let (_repo, scope) = mount(ProjectionConfig::default());
    let related = scope
        .related("user", &EntityId::from(1), "session")
        .unwrap();
    assert!(related.is_empty());
    let captured = events.lock().expect("capture lock");
    assert!(
        captured
            .iter()
            .any(|e| e.message == "projection.relation_fallback")
    );
}

#[test]
fn diagnostics_ring_is_bounded() {
    let (_repo, scope) = mount(ProjectionConfig::default().with_diagnostics_capacity(2));
    for n in 0..5 {
        scope.apply_batch(&[ChangeEvent::new("session", json!(n))]);
    }
    let diagnostics = scope.diagnostics();
    assert_eq!(diagnostics.faults().len(), 2);
    assert_eq!(diagnostics.counters().events_faulted, 5);
    assert_eq!(diagnostics.last_fault().map(|f| f.batch), Some(5));
}
