//! Persistence of the last known primary view (`gvwstate.dat`).
//!
//! After a full-cluster outage the nodes restore the primary component from
//! this file, so it must never be observed half-written: updates go to a
//! temp file in the same directory, are fsynced and then renamed over the
//! old file.
//!
//! The format is line-oriented UTF-8, order-independent within the view
//! section; unknown keys are ignored for forward compatibility:
//!
//! ```text
//! my_uuid: <uuid>
//! #vwbeg
//! view_id: <type-char> <uuid> <seq>
//! bootstrap: <0|1>
//! member: <uuid> <segment-id>
//! #vwend
//! ```

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use thiserror::Error;

use galena_types::{SegmentId, SourceId, ViewId, ViewType};

/// Name of the view-state file inside the configured base directory.
pub const VIEW_STATE_FILE: &str = "gvwstate.dat";

const TMP_SUFFIX: &str = ".tmp";

/// Errors reading or writing the view-state file.
#[derive(Debug, Error)]
pub enum ViewStateError {
    #[error("view state i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed view state line: {0:?}")]
    Malformed(String),

    #[error("view state missing field: {0}")]
    Missing(&'static str),
}

/// The persisted view state: own identity plus the membership of the last
/// known primary view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewState {
    my_uuid: SourceId,
    view_id: ViewId,
    bootstrap: bool,
    members: Vec<(SourceId, SegmentId)>,
}

impl ViewState {
    pub fn new(
        my_uuid: SourceId,
        view_id: ViewId,
        bootstrap: bool,
        members: Vec<(SourceId, SegmentId)>,
    ) -> Self {
        Self {
            my_uuid,
            view_id,
            bootstrap,
            members,
        }
    }

    pub fn my_uuid(&self) -> SourceId {
        self.my_uuid
    }

    pub fn view_id(&self) -> ViewId {
        self.view_id
    }

    pub fn bootstrap(&self) -> bool {
        self.bootstrap
    }

    pub fn members(&self) -> &[(SourceId, SegmentId)] {
        &self.members
    }

    fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("my_uuid: {}\n", self.my_uuid));
        out.push_str("#vwbeg\n");
        out.push_str(&format!("view_id: {}\n", self.view_id));
        out.push_str(&format!("bootstrap: {}\n", u8::from(self.bootstrap)));
        for (uuid, segment) in &self.members {
            out.push_str(&format!("member: {uuid} {segment}\n"));
        }
        out.push_str("#vwend\n");
        out
    }

    /// Atomically replaces `<dir>/gvwstate.dat`.
    pub fn write_file(&self, dir: &Path) -> Result<(), ViewStateError> {
        let path = dir.join(VIEW_STATE_FILE);
        let tmp_path = dir.join(format!("{VIEW_STATE_FILE}{TMP_SUFFIX}"));

        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(self.render().as_bytes())?;
        tmp.sync_all()?;
        drop(tmp);

        fs::rename(&tmp_path, &path)?;
        tracing::debug!(?path, "view state saved");
        Ok(())
    }

    /// Reads `<dir>/gvwstate.dat`.
    pub fn read_file(dir: &Path) -> Result<Self, ViewStateError> {
        let path = dir.join(VIEW_STATE_FILE);
        let content = fs::read_to_string(&path)?;

        let mut my_uuid = None;
        let mut view_id = None;
        let mut bootstrap = None;
        let mut members = Vec::new();
        let mut in_view = false;
        let mut view_closed = false;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line {
                "#vwbeg" => {
                    in_view = true;
                    continue;
                }
                "#vwend" => {
                    in_view = false;
                    view_closed = true;
                    continue;
                }
                _ => {}
            }

            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| ViewStateError::Malformed(line.to_string()))?;
            let value = value.trim();

            match key {
                "my_uuid" => {
                    my_uuid = Some(parse_uuid(value, line)?);
                }
                "view_id" if in_view => {
                    let mut fields = value.split_whitespace();
                    let type_char = fields
                        .next()
                        .and_then(|t| t.chars().next())
                        .and_then(ViewType::from_char)
                        .ok_or_else(|| ViewStateError::Malformed(line.to_string()))?;
                    let uuid = parse_uuid(
                        fields
                            .next()
                            .ok_or_else(|| ViewStateError::Malformed(line.to_string()))?,
                        line,
                    )?;
                    let seq = fields
                        .next()
                        .and_then(|s| s.parse::<u32>().ok())
                        .ok_or_else(|| ViewStateError::Malformed(line.to_string()))?;
                    view_id = Some(ViewId::new(type_char, uuid, seq));
                }
                "bootstrap" if in_view => {
                    bootstrap = Some(match value {
                        "0" => false,
                        "1" => true,
                        _ => return Err(ViewStateError::Malformed(line.to_string())),
                    });
                }
                "member" if in_view => {
                    let mut fields = value.split_whitespace();
                    let uuid = parse_uuid(
                        fields
                            .next()
                            .ok_or_else(|| ViewStateError::Malformed(line.to_string()))?,
                        line,
                    )?;
                    let segment = fields
                        .next()
                        .and_then(|s| s.parse::<SegmentId>().ok())
                        .ok_or_else(|| ViewStateError::Malformed(line.to_string()))?;
                    members.push((uuid, segment));
                }
                // unknown keys are ignored for forward compatibility
                _ => {}
            }
        }

        if !view_closed {
            return Err(ViewStateError::Missing("#vwend"));
        }

        Ok(Self {
            my_uuid: my_uuid.ok_or(ViewStateError::Missing("my_uuid"))?,
            view_id: view_id.ok_or(ViewStateError::Missing("view_id"))?,
            bootstrap: bootstrap.ok_or(ViewStateError::Missing("bootstrap"))?,
            members,
        })
    }

    /// Removes the view-state file if present.
    pub fn remove_file(dir: &Path) -> Result<(), ViewStateError> {
        match fs::remove_file(dir.join(VIEW_STATE_FILE)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn parse_uuid(value: &str, line: &str) -> Result<SourceId, ViewStateError> {
    value
        .parse()
        .map_err(|_| ViewStateError::Malformed(line.to_string()))
}
