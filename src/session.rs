//! Units of work: participant/session keys, the worklist they are read from, and the loop that
//! processes them one after the other.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, Trim};
use tracing::{error, info, info_span, warn, Span};

use crate::error::{PipelineError, Result};

/// one unit of work: a participant and one of their sessions, without the BIDS `sub-` and
/// `ses-` prefixes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub participant: String,
    pub session: String,
}

impl SessionKey {
    pub fn new(participant: impl AsRef<str>, session: impl AsRef<str>) -> Self {
        let participant = participant.as_ref().trim();
        let session = session.as_ref().trim();
        Self {
            participant: participant.strip_prefix("sub-").unwrap_or(participant).to_string(),
            session: session.strip_prefix("ses-").unwrap_or(session).to_string(),
        }
    }

    /// `sub-<participant>/ses-<session>` relative to a dataset root
    pub fn session_dir(&self) -> PathBuf {
        Path::new(&format!("sub-{}", self.participant)).join(format!("ses-{}", self.session))
    }

    /// `sub-<participant>/ses-<session>/anat` relative to a dataset root
    pub fn anat_dir(&self) -> PathBuf {
        self.session_dir().join("anat")
    }

    /// `sub-<participant>_ses-<session>`, the leading entities of every file name
    pub fn file_prefix(&self) -> String {
        format!("sub-{}_ses-{}", self.participant, self.session)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{} ses-{}", self.participant, self.session)
    }
}

/// reads a two-column worklist (participant, session) without a header row. Blank lines are
/// skipped. Rows are returned in file order.
pub fn read_worklist(path: impl AsRef<Path>) -> Result<Vec<SessionKey>> {
    let path = path.as_ref();
    let file = BufReader::new(File::open(path)?);
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .trim(Trim::All)
        .flexible(true)
        .comment(Some(b'#'))
        .from_reader(file);

    let mut keys = Vec::new();
    for (row, record) in rdr.records().enumerate() {
        let record = record?;
        if record.iter().all(|field| field.is_empty()) {
            continue;
        }
        if record.len() != 2 || record[0].is_empty() || record[1].is_empty() {
            return Err(PipelineError::Worklist {
                path: path.to_path_buf(),
                reason: format!("row {} must have exactly two non-empty columns, found {:?}", row + 1, record),
            });
        }
        keys.push(SessionKey::new(&record[0], &record[1]));
    }
    Ok(keys)
}

/// what happened to a session that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    /// the session output directory already existed
    AlreadyDone,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub completed: usize,
    pub already_done: usize,
    pub skipped: Vec<SessionKey>,
}

/// span attached to every log line emitted while a session is processed
pub fn session_span(key: &SessionKey) -> Span {
    info_span!("session", participant = %key.participant, session = %key.session)
}

/// processes sessions one after the other. Session errors are logged and the session is skipped,
/// any other error ends the batch.
pub fn run_sessions<F>(sessions: &[SessionKey], mut process: F) -> Result<BatchSummary>
where
    F: FnMut(&SessionKey) -> Result<SessionOutcome>,
{
    let mut summary = BatchSummary::default();
    for key in sessions {
        let _span = session_span(key).entered();
        info!("processing participant {}, session {}", key.participant, key.session);
        match process(key) {
            Ok(SessionOutcome::Completed) => summary.completed += 1,
            Ok(SessionOutcome::AlreadyDone) => {
                info!("outputs already exist for participant {}, session {}", key.participant, key.session);
                summary.already_done += 1;
            }
            Err(e @ PipelineError::ExternalTool { .. }) => {
                error!("skipping session: {e}");
                summary.skipped.push(key.clone());
            }
            Err(e) if e.is_session_error() => {
                warn!("skipping session: {e}");
                summary.skipped.push(key.clone());
            }
            Err(e) => return Err(e),
        }
    }
    info!(
        "{} sessions completed, {} already done, {} skipped",
        summary.completed,
        summary.already_done,
        summary.skipped.len()
    );
    Ok(summary)
}
