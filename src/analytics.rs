use reqwest::Url;
use serde::Serialize;

use crate::{models::ExperimentEvent, Error, Result};

/// Error returned by an [`AnalyticsSink`]. It is logged and discarded by the client.
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// External analytics destination for assign/expose/convert events.
///
/// Delivery is best-effort: errors never affect the resolved assignment and are never retried.
pub trait AnalyticsSink {
    fn log(&self, event_name: &str, event: &ExperimentEvent) -> std::result::Result<(), SinkError>;
}

pub(crate) struct NoopAnalyticsSink;
impl AnalyticsSink for NoopAnalyticsSink {
    fn log(
        &self,
        _event_name: &str,
        _event: &ExperimentEvent,
    ) -> std::result::Result<(), SinkError> {
        Ok(())
    }
}

impl<T: Fn(&str, &ExperimentEvent) -> std::result::Result<(), SinkError>> AnalyticsSink for T {
    fn log(&self, event_name: &str, event: &ExperimentEvent) -> std::result::Result<(), SinkError> {
        self(event_name, event)
    }
}

/// Posts each event as JSON to a collector endpoint.
pub struct HttpAnalyticsSink {
    client: reqwest::blocking::Client,
    url: Url,
}

#[derive(Serialize)]
struct Envelope<'a> {
    event: &'a str,
    payload: &'a ExperimentEvent,
}

impl HttpAnalyticsSink {
    pub fn new(url: &str) -> Result<HttpAnalyticsSink> {
        let url = Url::parse(url).map_err(Error::InvalidBaseUrl)?;
        Ok(HttpAnalyticsSink {
            client: reqwest::blocking::Client::new(),
            url,
        })
    }
}

impl AnalyticsSink for HttpAnalyticsSink {
    fn log(&self, event_name: &str, event: &ExperimentEvent) -> std::result::Result<(), SinkError> {
        self.client
            .post(self.url.clone())
            .json(&Envelope {
                event: event_name,
                payload: event,
            })
            .send()?
            .error_for_status()?;
        Ok(())
    }
}
