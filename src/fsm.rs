// Replicated "who is primary" record

use crate::{
    consensus::{LogEntry, LogKind, SnapshotSink, StateMachine, StateSnapshot},
    primary::{PrimaryInfo, PrimaryProvider, PrimaryRedirectInfo},
    Error, Result,
};
use parking_lot::RwLock;
use std::io::{Read, Write};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Applied {
    info: PrimaryRedirectInfo,
    last_index: u64,
}

/// State machine holding the single primary record.
///
/// Writes only happen through [`StateMachine::apply`] and
/// [`StateMachine::restore`], which the engine calls one at a time. Reads
/// reflect the latest locally applied entry and may lag the cluster.
#[derive(Debug, Default)]
pub struct PrimaryStateMachine {
    state: RwLock<Applied>,
}

impl PrimaryStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn primary_info(&self) -> PrimaryInfo {
        self.state.read().info.primary.clone()
    }

    pub fn redirect_url(&self) -> String {
        self.state.read().info.redirect_url.clone()
    }

    /// Index of the last entry this machine applied itself, 0 if none since
    /// construction or the last restore. Snapshots carry only the record, so
    /// a restored machine reports 0 until its next apply.
    pub fn last_applied(&self) -> u64 {
        self.state.read().last_index
    }
}

impl PrimaryProvider for PrimaryStateMachine {
    fn primary_redirect_info(&self) -> PrimaryRedirectInfo {
        self.state.read().info.clone()
    }
}

impl StateMachine for PrimaryStateMachine {
    fn apply(&self, entry: &LogEntry) -> Result<()> {
        match entry.kind {
            LogKind::Command => {
                // Decode fully before touching state so a bad payload leaves
                // the previous record in place.
                let info = PrimaryRedirectInfo::decode(&entry.data).map_err(|e| {
                    warn!(index = entry.index, error = %e, "cannot read the payload");
                    e
                })?;
                debug!(
                    index = entry.index,
                    term = entry.term,
                    advertise_url = %info.primary.advertise_url,
                    "applied primary record"
                );
                let mut state = self.state.write();
                state.info = info;
                state.last_index = entry.index;
                Ok(())
            }
            kind => Err(Error::UnknownLogKind(kind)),
        }
    }

    fn snapshot(&self) -> Result<Box<dyn StateSnapshot>> {
        let state = self.state.read();
        Ok(Box::new(PrimarySnapshot {
            info: state.info.clone(),
        }))
    }

    fn restore(&self, mut source: Box<dyn Read + Send>) -> Result<()> {
        let mut raw = Vec::new();
        let read = source.read_to_end(&mut raw);
        drop(source);
        read?;

        let info = PrimaryRedirectInfo::decode(&raw)?;
        debug!(advertise_url = %info.primary.advertise_url, "restored primary record");
        *self.state.write() = Applied { info, last_index: 0 };
        Ok(())
    }
}

/// Copy of the record taken at snapshot time; later applies do not affect it.
#[derive(Debug, Clone)]
pub struct PrimarySnapshot {
    info: PrimaryRedirectInfo,
}

impl StateSnapshot for PrimarySnapshot {
    fn persist(&self, mut sink: Box<dyn SnapshotSink>) -> Result<()> {
        let written = self
            .info
            .encode()
            .and_then(|bytes| sink.write_all(&bytes).map_err(Error::from));

        if let Err(e) = written {
            warn!(sink = sink.id(), error = %e, "cannot persist snapshot");
            if let Err(cancel_err) = sink.cancel() {
                warn!(error = %cancel_err, "cannot cancel snapshot sink");
            }
            return Err(e);
        }
        sink.close()?;
        Ok(())
    }
}
