//! Log line formatting.
//!
//! Every line has the shape
//! `<RFC3339 timestamp> [<service>] [<LEVEL>] [<short transaction id>]: <message>`,
//! with `N/A` in the transaction slot when no transaction is active.

use std::fmt;

use chrono::SecondsFormat;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

use crate::{TransactionContext, UNKNOWN_TRANSACTION};

/// [`FormatEvent`] that prefixes each event with the service name and the
/// short id of the active [`TransactionContext`].
#[derive(Debug, Clone)]
pub struct TransactionFormat {
    service_name: String,
}

impl TransactionFormat {
    /// Formatter tagging every line with `service_name`.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    /// The configured service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

fn level_label(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "ERROR",
        Level::WARN => "WARN",
        Level::INFO => "INFO",
        Level::DEBUG => "DEBUG",
        Level::TRACE => "TRACE",
    }
}

impl<S, N> FormatEvent<S, N> for TransactionFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let current = TransactionContext::current();
        let short_id = current
            .as_deref()
            .map(TransactionContext::short_id)
            .unwrap_or(UNKNOWN_TRANSACTION);

        write!(
            writer,
            "{timestamp} [{}] [{}] [{short_id}]: ",
            self.service_name,
            level_label(event.metadata().level())
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
