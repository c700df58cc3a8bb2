//! Metadata-store registration of persisted files

use crate::error::IngestError;
use chrono::{FixedOffset, Local, NaiveDateTime, TimeZone, Timelike, Utc};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

/// What the metadata store learns about one persisted file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub gid: String,
    pub uid: String,
    pub cid: String,
    pub filename: String,
    /// Absolute directory holding the file
    pub directory: PathBuf,
    /// Observation time in UTC
    pub utc: NaiveDateTime,
}

impl Registration {
    /// `CCYYMMDDThhmmss`, whole seconds
    pub fn gen_time(&self) -> String {
        self.utc.format("%Y%m%dT%H%M%S").to_string()
    }

    pub fn fraction_micros(&self) -> u32 {
        self.utc.nanosecond() / 1_000
    }
}

pub trait MetadataStore: Send {
    fn register(&self, reg: &Registration) -> Result<(), IngestError>;
}

/// Convert a local observation time to UTC. `offset` pins the local zone;
/// `None` uses the host's zone.
pub fn canonical_utc(tmobs: &str, offset: Option<FixedOffset>) -> Result<NaiveDateTime, IngestError> {
    let naive = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y%m%dT%H%M%S%.f"]
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(tmobs.trim(), f).ok())
        .ok_or_else(|| IngestError::Registration(format!("bad observation time <{tmobs}>")))?;
    let utc = match offset {
        Some(off) => off
            .from_local_datetime(&naive)
            .single()
            .map(|t| t.with_timezone(&Utc)),
        None => Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|t| t.with_timezone(&Utc)),
    };
    utc.map(|t| t.naive_utc())
        .ok_or_else(|| IngestError::Registration(format!("nonexistent local time <{tmobs}>")))
}

/// Posts registrations as a form to `<root>/regOrigImg.action`
pub struct HttpRegistrar {
    url: String,
    client: OnceLock<reqwest::blocking::Client>,
}

impl HttpRegistrar {
    pub const ENDPOINT: &'static str = "regOrigImg.action";

    pub fn new(root_url: &str) -> Self {
        let mut url = root_url.trim().to_string();
        if !url.ends_with('/') {
            url.push('/');
        }
        url.push_str(Self::ENDPOINT);
        Self {
            url,
            client: OnceLock::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    // Built on first use so it lives on the writer thread, outside any async runtime
    fn client(&self) -> Result<&reqwest::blocking::Client, IngestError> {
        if let Some(c) = self.client.get() {
            return Ok(c);
        }
        let c = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| IngestError::Registration(e.to_string()))?;
        Ok(self.client.get_or_init(|| c))
    }
}

impl MetadataStore for HttpRegistrar {
    fn register(&self, reg: &Registration) -> Result<(), IngestError> {
        let dir = reg.directory.to_string_lossy().to_string();
        let params = [
            ("groupId", reg.gid.clone()),
            ("unitId", reg.uid.clone()),
            ("camId", reg.cid.clone()),
            ("imgName", reg.filename.clone()),
            ("imgPath", dir),
            ("genTime", reg.gen_time()),
            ("genTimeUs", reg.fraction_micros().to_string()),
        ];
        let resp = self
            .client()?
            .post(&self.url)
            .form(&params)
            .send()
            .map_err(|e| IngestError::Registration(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(IngestError::Registration(format!(
                "{} answered {}",
                self.url,
                resp.status()
            )));
        }
        Ok(())
    }
}
