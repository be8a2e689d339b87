use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event as XmlEvent};
use quick_xml::reader::Reader;
use tracing::debug;

use super::{Report, Reporter, ReporterError};
use crate::ci::BuildInfo;
use crate::config::PhpUnitConfig;
use crate::pr::PullRecord;

/// One summary comment from a PHPUnit JUnit XML report.
pub struct PhpUnitReporter {
    artifact: String,
    failure_limit: usize,
}

impl PhpUnitReporter {
    pub fn new(config: &PhpUnitConfig) -> Self {
        Self {
            artifact: config.artifact.clone(),
            failure_limit: config.failure_limit,
        }
    }
}

fn is_failure(name: &[u8]) -> bool {
    name == b"failure" || name == b"error"
}

fn message_attribute(tag: &BytesStart<'_>) -> String {
    tag.try_get_attribute("message")
        .ok()
        .flatten()
        .and_then(|attr| attr.unescape_value().ok().map(|value| value.into_owned()))
        .unwrap_or_default()
}

/// Collect the text of every `<failure>` and `<error>` element, in document
/// order, however deeply the suites nest. Elements without text fall back to
/// their `message` attribute.
pub fn collect_failures(xml: &str) -> Result<Vec<String>, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut failures = Vec::new();
    let mut current: Option<(String, String)> = None;
    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(tag)) if is_failure(tag.name().as_ref()) => {
                current = Some((String::new(), message_attribute(&tag)));
            }
            Ok(XmlEvent::Empty(tag)) if is_failure(tag.name().as_ref()) => {
                failures.push(message_attribute(&tag));
            }
            Ok(XmlEvent::Text(text)) => {
                if let Some((body, _)) = current.as_mut() {
                    body.push_str(&text.unescape().map_err(|err| err.to_string())?);
                }
            }
            Ok(XmlEvent::CData(data)) => {
                if let Some((body, _)) = current.as_mut() {
                    body.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Ok(XmlEvent::End(tag)) if is_failure(tag.name().as_ref()) => {
                if let Some((body, message)) = current.take() {
                    failures.push(if body.trim().is_empty() { message } else { body });
                }
            }
            Ok(XmlEvent::Eof) => break,
            Ok(_) => {}
            Err(err) => {
                return Err(format!(
                    "at byte {}: {err}",
                    reader.error_position()
                ))
            }
        }
    }
    Ok(failures)
}

/// Render the summary comment, or nothing when no test failed. At most
/// `limit` failures are quoted.
pub fn summarize(failures: &[String], limit: usize, build_url: &str) -> Option<String> {
    if failures.is_empty() {
        return None;
    }

    let mut message = format!(
        "Build failed due to test failures. __{}__ test failure(s) found.\n",
        failures.len()
    );
    for failure in failures.iter().take(limit) {
        for line in failure.lines().filter(|line| !line.trim().is_empty()) {
            message.push('>');
            message.push_str(line);
            message.push('\n');
        }
        message.push('\n');
    }
    if failures.len() > limit {
        message.push_str(
            "There were too many failures to display detailed information on all of them. \
             View build details for full list of failures\n",
        );
    }
    message.push_str(&format!("\n[Click Here For More Information]({build_url})"));
    Some(message)
}

#[async_trait]
impl Reporter for PhpUnitReporter {
    fn name(&self) -> &str {
        "phpunit"
    }

    fn artifact_path(&self) -> &str {
        &self.artifact
    }

    async fn report(
        &self,
        build: &BuildInfo,
        _record: &PullRecord,
        artifact: &str,
    ) -> Result<Report, ReporterError> {
        let failures = collect_failures(artifact).map_err(|reason| ReporterError::Malformed {
            reporter: self.name().to_string(),
            reason,
        })?;
        debug!(failures = failures.len(), "phpunit report read");
        Ok(Report {
            inline: Vec::new(),
            summary: summarize(&failures, self.failure_limit, &build.url),
        })
    }
}
