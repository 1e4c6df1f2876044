//! Discovery of a worker's HTTP port from its captured output.
//!
//! The worker prints a line such as
//! `Listening for HTTP and REST traffic on  http://10.0.0.5:54321/`
//! once it is ready. The file is re-read on every attempt because the
//! worker keeps appending to it.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Text that precedes the worker's HTTP URL.
pub const LISTENING_MARKER: &str = "Listening for HTTP and REST traffic on";

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("could not scrape port from {path} after {retries} attempts")]
    Timeout { path: PathBuf, retries: u32 },
}

pub type Result<T> = std::result::Result<T, ScrapeError>;

/// Extract `(host, port)` from a line announcing the worker's HTTP endpoint.
pub fn parse_listening_line(line: &str) -> Option<(String, u16)> {
    let (_, rest) = line.split_once(LISTENING_MARKER)?;
    let (_, url) = rest.split_once("http://")?;
    let authority = url.split_whitespace().next()?;
    let authority = authority.split('/').next()?;
    let (host, port) = authority.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let digits: String = port.chars().take_while(char::is_ascii_digit).collect();
    let port = digits.parse().ok()?;
    Some((host.to_string(), port))
}

/// Search captured output for the first listening announcement.
///
/// Only complete lines count; a trailing line without its newline may still
/// be mid-write.
pub fn find_listening_port(content: &str) -> Option<u16> {
    content
        .split_inclusive('\n')
        .filter(|line| line.ends_with('\n'))
        .find_map(parse_listening_line)
        .map(|(_, port)| port)
}

/// Bounded, cancellable port scraper.
#[derive(Debug, Clone)]
pub struct PortScraper {
    max_retries: u32,
    retry_interval: Duration,
}

impl PortScraper {
    pub fn new(max_retries: u32, retry_interval: Duration) -> Self {
        Self {
            max_retries,
            retry_interval,
        }
    }

    pub fn from_config(config: &cloudrun_core::Config) -> Self {
        Self::new(
            config.port_scrape_retries,
            Duration::from_millis(config.port_scrape_interval_ms),
        )
    }

    /// Wait for `output_file` to announce a port.
    ///
    /// Returns `Ok(None)` if the scrape was cancelled, either through `cancel`
    /// or because `stop_requested` returned true. A file that does not exist
    /// yet counts as no match.
    pub async fn scrape(
        &self,
        output_file: &Path,
        cancel: &CancellationToken,
        stop_requested: impl Fn() -> bool,
    ) -> Result<Option<u16>> {
        for attempt in 1..=self.max_retries {
            if cancel.is_cancelled() || stop_requested() {
                return Ok(None);
            }

            if let Ok(content) = tokio::fs::read_to_string(output_file).await {
                if let Some(port) = find_listening_port(&content) {
                    debug!(port, attempt, file = %output_file.display(), "scraped worker port");
                    return Ok(Some(port));
                }
            }

            tokio::select! {
                () = tokio::time::sleep(self.retry_interval) => {}
                () = cancel.cancelled() => return Ok(None),
            }
        }

        Err(ScrapeError::Timeout {
            path: output_file.to_path_buf(),
            retries: self.max_retries,
        })
    }
}
