//! Child-process side of the subprocess protocol.
//!
//! The binary hosting the service calls [`run_child`] when launched with the
//! hidden `run-job` argument. The child reads one [`ChildRequest`] from
//! stdin, reconstructs nothing (the executor comes from the binary's own
//! wiring), and reports everything through stdout events: every tracing
//! event becomes a `Log` event, every progress callback a `Progress` event,
//! and exactly one `Result` or `Error` event ends the stream.

use std::io::{Read, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::Level;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

use crate::executor::{Executor, ProgressSink};
use crate::models::JobType;
use crate::runner::{ChildEvent, ChildRequest};

/// Serializes events onto the stdout stream, one JSON document per line.
pub struct EventWriter {
    out: Mutex<std::io::Stdout>,
}

impl EventWriter {
    pub fn stdout() -> Arc<Self> {
        Arc::new(Self {
            out: Mutex::new(std::io::stdout()),
        })
    }

    fn write(&self, event: &ChildEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            if let Ok(mut out) = self.out.lock() {
                let _ = writeln!(out, "{line}");
                let _ = out.flush();
            }
        }
    }

    fn log(&self, level: &str, logger: &str, message: String) {
        self.write(&ChildEvent::Log {
            timestamp: Utc::now(),
            level: level.to_string(),
            logger: logger.to_string(),
            message,
        });
    }
}

struct WriterSink(Arc<EventWriter>);

impl ProgressSink for WriterSink {
    fn emit(&self, event: &str, metrics: &Map<String, Value>) {
        self.0.write(&ChildEvent::Progress {
            event: event.to_string(),
            metrics: metrics.clone(),
        });
    }
}

/// Forwards tracing events emitted inside the child as `Log` events.
pub struct JobLogLayer {
    writer: Arc<EventWriter>,
}

impl JobLogLayer {
    pub fn new(writer: Arc<EventWriter>) -> Self {
        Self { writer }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push(format!("{}={value:?}", field.name()));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={value}", field.name()));
        }
    }
}

impl MessageVisitor {
    fn render(mut self) -> String {
        if !self.fields.is_empty() {
            if !self.message.is_empty() {
                self.message.push(' ');
            }
            self.message.push_str(&self.fields.join(" "));
        }
        self.message
    }
}

impl<S: tracing::Subscriber> Layer<S> for JobLogLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() > Level::INFO {
            return;
        }
        let level = match *metadata.level() {
            Level::ERROR => "ERROR",
            Level::WARN => "WARNING",
            _ => "INFO",
        };
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.writer.log(level, metadata.target(), visitor.render());
    }
}

fn read_request() -> anyhow::Result<ChildRequest> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    Ok(serde_json::from_str(&input)?)
}

fn execute(
    executor: &dyn Executor,
    request: &ChildRequest,
    sink: &dyn ProgressSink,
) -> anyhow::Result<Value> {
    match request.job_type {
        JobType::Run => {
            let payload = serde_json::from_value(request.payload.clone())?;
            let response = executor.run(&payload, &request.job_id, sink)?;
            Ok(serde_json::to_value(response)?)
        }
        JobType::GridSearch => {
            let payload = serde_json::from_value(request.payload.clone())?;
            let response = executor.run_grid(&payload, &request.job_id, sink)?;
            Ok(serde_json::to_value(response)?)
        }
    }
}

/// Child-process entry point. Returns the process exit code.
pub fn run_child(executor: Arc<dyn Executor>) -> i32 {
    let writer = EventWriter::stdout();

    let request = match read_request() {
        Ok(request) => request,
        Err(err) => {
            writer.write(&ChildEvent::Error {
                message: format!("Failed to read job request: {err}"),
                traceback: format!("{err:?}"),
            });
            return 1;
        }
    };

    let subscriber =
        tracing_subscriber::registry().with(JobLogLayer::new(Arc::clone(&writer)));
    // Best effort: embedding tests may have installed a subscriber already.
    let _ = tracing::subscriber::set_global_default(subscriber);

    let sink = WriterSink(Arc::clone(&writer));
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        execute(executor.as_ref(), &request, &sink)
    }));

    match outcome {
        Ok(Ok(result)) => {
            writer.write(&ChildEvent::Result { result });
            0
        }
        Ok(Err(err)) => {
            writer.write(&ChildEvent::Error {
                message: err.to_string(),
                traceback: format!("{err:?}"),
            });
            1
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "optimization panicked".to_string());
            writer.write(&ChildEvent::Error {
                traceback: format!("panic: {message}"),
                message,
            });
            1
        }
    }
}
