use std::{
    collections::HashMap,
    env, io,
    path::{Path, PathBuf},
};
use tracing::{field::Visit, span, Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::writer::MakeWriterExt,
    layer::{Context, Layer},
    prelude::*,
    registry, EnvFilter,
};

// --- Span-field tag filtering ---
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

struct TagFilterLayer {
    filters: Vec<Tag>,
}

impl<S> Layer<S> for TagFilterLayer
where
    S: Subscriber + for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut fields = HashMap::new();
        let mut visitor = FieldVisitor(&mut fields);
        attrs.record(&mut visitor);
        span.extensions_mut().insert(fields);
    }

    // Checked per event so spans are always recorded and callsite interest
    // is never cached as "off".
    fn event_enabled(&self, event: &Event<'_>, ctx: Context<'_, S>) -> bool {
        if self.filters.is_empty() {
            return true;
        }

        // With tags set, events outside any span are dropped.
        let Some(scope) = ctx.event_scope(event) else {
            return false;
        };

        let mut all_fields = HashMap::new();
        for span_ref in scope {
            if let Some(fields) = span_ref.extensions().get::<HashMap<String, String>>() {
                for (k, v) in fields {
                    all_fields.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }

        self.filters.iter().all(|filter| {
            all_fields
                .get(&filter.key)
                .is_some_and(|value| filter.value == "*" || value.contains(&filter.value))
        })
    }
}

struct FieldVisitor<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{value:?}"));
    }
}

/// Parse `RES_LOG_TAGS`, e.g. `config:lab1,request_id:*`.
pub fn parse_tags(raw: &str) -> Vec<Tag> {
    raw.split(',')
        .filter_map(|s| {
            let (key, value) = s.split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some(Tag {
                key: key.to_string(),
                value: value.trim().to_string(),
            })
        })
        .collect()
}

/// Logging settings, normally read from `RES_LOG_*` environment variables.
#[derive(Debug, Clone)]
pub struct LogSettings {
    pub level: String,
    /// `console`, `file`, `both` or `none`.
    pub output: String,
    /// `human` or `json`.
    pub format: String,
    pub tags: Vec<Tag>,
    pub file: PathBuf,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: "console".to_string(),
            format: "human".to_string(),
            tags: Vec::new(),
            file: env::temp_dir().join("res-engine.log"),
        }
    }
}

impl LogSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            level: env::var("RES_LOG_LEVEL").unwrap_or(defaults.level),
            output: env::var("RES_LOG_OUTPUT").unwrap_or(defaults.output),
            format: env::var("RES_LOG_FORMAT").unwrap_or(defaults.format),
            tags: env::var("RES_LOG_TAGS")
                .map(|raw| parse_tags(&raw))
                .unwrap_or_default(),
            file: env::var("RES_LOG_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.file),
        }
    }

    fn use_console(&self) -> bool {
        self.output == "console" || self.output == "both"
    }

    fn use_file(&self) -> bool {
        self.output == "file" || self.output == "both"
    }
}

fn build_filter(level: &str) -> EnvFilter {
    let mut filter = EnvFilter::try_from_env("RES_LOG")
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    for noisy in ["tokio=warn", "hyper=warn", "reqwest=warn"] {
        if let Ok(directive) = noisy.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Initializes the global tracing subscriber from `RES_LOG_*` variables.
///
/// Console output goes to stderr so command results on stdout stay
/// machine-readable. Keep the returned guard alive for the life of the process
/// when file output is enabled.
pub fn init_subscriber() -> Option<WorkerGuard> {
    init_with(&LogSettings::from_env())
}

pub fn init_with(settings: &LogSettings) -> Option<WorkerGuard> {
    let is_json = settings.format == "json";
    let mut guard: Option<WorkerGuard> = None;

    let subscriber = registry()
        .with(build_filter(&settings.level))
        .with(TagFilterLayer {
            filters: settings.tags.clone(),
        });

    let log_dir = settings
        .file
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(env::temp_dir);
    let log_filename = settings
        .file
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "res-engine.log".into());

    // try_init: a second initialisation (tests, embedded use) is not fatal.
    let result = match (settings.use_console(), settings.use_file()) {
        (true, true) => {
            let file_appender = tracing_appender::rolling::daily(&log_dir, &log_filename);
            let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
            guard = Some(file_guard);

            let fmt_layer =
                tracing_subscriber::fmt::layer().with_writer(io::stderr.and(non_blocking));
            if is_json {
                subscriber.with(fmt_layer.json()).try_init()
            } else {
                subscriber.with(fmt_layer).try_init()
            }
        }
        (true, false) => {
            let fmt_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);
            if is_json {
                subscriber.with(fmt_layer.json()).try_init()
            } else {
                subscriber.with(fmt_layer).try_init()
            }
        }
        (false, true) => {
            let file_appender = tracing_appender::rolling::daily(&log_dir, &log_filename);
            let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
            guard = Some(file_guard);

            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking);
            if is_json {
                subscriber.with(fmt_layer.json()).try_init()
            } else {
                subscriber.with(fmt_layer).try_init()
            }
        }
        (false, false) => subscriber.try_init(),
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }

    guard
}
