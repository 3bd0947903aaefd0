//! Cluster-wide admin queries
//!
//! A [`ServersQuery`] is a small admin command (list processes, close a
//! process, sweep old processes) addressed to every process server in a
//! cluster. The [`Cluster`] scatter-gathers it across all endpoints and
//! returns a per-server result map; one unreachable server degrades its
//! own entry to [`QueryOutcome::Unavailable`] and never fails the whole
//! query. Queries have a compact argument-list wire form so they can ride
//! the ordinary function-call envelope between hosts.

use async_trait::async_trait;
use codec::{decode_args_list, encode_args, ArgValue, CodecError, ProcessMessage};
use futures::future::join_all;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use types::{FormatError, ProcessId, ProcessUnavailable};

const CMD_PROCESS_SUMMARY: &str = "ps";
const CMD_ALL_IDS: &str = "all_ids";
const CMD_CLOSE_PID: &str = "close_pid";
const CMD_CLOSE_OLDER_THAN: &str = "close_older_than";
const CMD_ALL_SERVER_NAMES: &str = "all_process_srvs";

const FLAG_HARD: &str = "hard";
const FLAG_COUNT: &str = "count";

/// One admin command, executable on every server in the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServersQuery {
    /// Per-class process counts for an application.
    ProcessSummary {
        account: String,
        app_name: String,
        process_class: Option<String>,
    },
    /// Every hosted process id of an application, with details.
    AllProcessIdsOf {
        account: String,
        app_name: String,
        process_class: Option<String>,
    },
    /// Close one process wherever it is hosted.
    CloseProcessId { id: ProcessId },
    /// Close (or count) application processes created at or before
    /// `older_than_ms` (epoch milliseconds). A soft close delivers a
    /// kill signal and lets the process wind down; a hard kill closes
    /// it outright.
    CloseOlderThan {
        account: String,
        app_name: String,
        process_class: Option<String>,
        older_than_ms: i64,
        hard_kill: bool,
        count_only: bool,
    },
    /// The names of every server in the cluster. Answered locally from
    /// the cluster view, without fan-out.
    AllServerNames,
}

impl ServersQuery {
    /// Whether the query is answered from the local cluster view rather
    /// than scattered to every server.
    pub fn is_local(&self) -> bool {
        matches!(self, ServersQuery::AllServerNames)
    }

    /// Wire form of the query.
    pub fn to_args(&self) -> Vec<ArgValue> {
        match self {
            ServersQuery::ProcessSummary {
                account,
                app_name,
                process_class,
            } => vec![
                ArgValue::from(CMD_PROCESS_SUMMARY),
                ArgValue::from(account.as_str()),
                ArgValue::from(app_name.as_str()),
                ArgValue::from(process_class.clone()),
            ],
            ServersQuery::AllProcessIdsOf {
                account,
                app_name,
                process_class,
            } => vec![
                ArgValue::from(CMD_ALL_IDS),
                ArgValue::from(account.as_str()),
                ArgValue::from(app_name.as_str()),
                ArgValue::from(process_class.clone()),
            ],
            ServersQuery::CloseProcessId { id } => vec![
                ArgValue::from(CMD_CLOSE_PID),
                ArgValue::from(id.to_string()),
            ],
            ServersQuery::CloseOlderThan {
                account,
                app_name,
                process_class,
                older_than_ms,
                hard_kill,
                count_only,
            } => vec![
                ArgValue::from(CMD_CLOSE_OLDER_THAN),
                ArgValue::from(account.as_str()),
                ArgValue::from(app_name.as_str()),
                ArgValue::from(process_class.clone()),
                ArgValue::from(*older_than_ms),
                ArgValue::from(if *hard_kill { FLAG_HARD } else { "" }),
                ArgValue::from(if *count_only { FLAG_COUNT } else { "" }),
            ],
            ServersQuery::AllServerNames => vec![ArgValue::from(CMD_ALL_SERVER_NAMES)],
        }
    }

    pub fn to_message(&self) -> ProcessMessage {
        encode_args(&self.to_args()).unwrap_or_else(|_| ProcessMessage::empty())
    }

    /// Parses the wire form back into a query.
    pub fn from_args(args: &[ArgValue]) -> Result<Self, QueryParseError> {
        let command = str_arg(args, 0)?;
        match command {
            CMD_PROCESS_SUMMARY => Ok(ServersQuery::ProcessSummary {
                account: str_arg(args, 1)?.to_string(),
                app_name: str_arg(args, 2)?.to_string(),
                process_class: opt_str_arg(args, 3)?,
            }),
            CMD_ALL_IDS => Ok(ServersQuery::AllProcessIdsOf {
                account: str_arg(args, 1)?.to_string(),
                app_name: str_arg(args, 2)?.to_string(),
                process_class: opt_str_arg(args, 3)?,
            }),
            CMD_CLOSE_PID => Ok(ServersQuery::CloseProcessId {
                id: str_arg(args, 1)?.parse().map_err(QueryParseError::BadProcessId)?,
            }),
            CMD_CLOSE_OLDER_THAN => Ok(ServersQuery::CloseOlderThan {
                account: str_arg(args, 1)?.to_string(),
                app_name: str_arg(args, 2)?.to_string(),
                process_class: opt_str_arg(args, 3)?,
                older_than_ms: i64_arg(args, 4)?,
                hard_kill: str_arg(args, 5)? == FLAG_HARD,
                count_only: str_arg(args, 6)? == FLAG_COUNT,
            }),
            CMD_ALL_SERVER_NAMES => Ok(ServersQuery::AllServerNames),
            other => Err(QueryParseError::UnknownCommand(other.to_string())),
        }
    }

    pub fn from_message(message: &ProcessMessage) -> Result<Self, QueryParseError> {
        let args = decode_args_list(message, 0)?;
        Self::from_args(&args)
    }
}

fn str_arg(args: &[ArgValue], index: usize) -> Result<&str, QueryParseError> {
    match args.get(index) {
        Some(ArgValue::Str(s)) => Ok(s),
        Some(_) => Err(QueryParseError::BadArgument { index }),
        None => Err(QueryParseError::MissingArgument { index }),
    }
}

fn opt_str_arg(args: &[ArgValue], index: usize) -> Result<Option<String>, QueryParseError> {
    match args.get(index) {
        Some(ArgValue::Str(s)) => Ok(Some(s.clone())),
        Some(ArgValue::Null) => Ok(None),
        Some(_) => Err(QueryParseError::BadArgument { index }),
        None => Err(QueryParseError::MissingArgument { index }),
    }
}

fn i64_arg(args: &[ArgValue], index: usize) -> Result<i64, QueryParseError> {
    match args.get(index) {
        Some(ArgValue::I64(v)) => Ok(*v),
        Some(_) => Err(QueryParseError::BadArgument { index }),
        None => Err(QueryParseError::MissingArgument { index }),
    }
}

/// Malformed servers-query wire form.
#[derive(Debug, Error)]
pub enum QueryParseError {
    #[error("unknown query command {0:?}")]
    UnknownCommand(String),

    #[error("missing query argument at index {index}")]
    MissingArgument { index: usize },

    #[error("query argument at index {index} has the wrong kind")]
    BadArgument { index: usize },

    #[error("malformed process id in query")]
    BadProcessId(#[source] FormatError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// One server's answer within a scatter-gather result.
#[derive(Debug, Clone)]
pub enum QueryOutcome {
    Ok(serde_json::Value),
    /// The server could not be reached; the rest of the cluster's
    /// answers are unaffected.
    Unavailable(ProcessUnavailable),
}

impl Serialize for QueryOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        match self {
            QueryOutcome::Ok(value) => map.serialize_entry("ok", value)?,
            QueryOutcome::Unavailable(err) => {
                map.serialize_entry("unavailable", &err.to_string())?
            }
        }
        map.end()
    }
}

/// One queryable server, local or remote.
#[async_trait]
pub trait QueryEndpoint: Send + Sync {
    fn server_name(&self) -> &str;

    async fn execute(&self, query: &ServersQuery) -> Result<serde_json::Value, ProcessUnavailable>;
}

/// The set of process servers a query fans out across.
#[derive(Clone)]
pub struct Cluster {
    endpoints: Arc<Vec<Arc<dyn QueryEndpoint>>>,
}

impl Cluster {
    pub fn new(endpoints: Vec<Arc<dyn QueryEndpoint>>) -> Self {
        Self {
            endpoints: Arc::new(endpoints),
        }
    }

    pub fn server_names(&self) -> Vec<String> {
        self.endpoints
            .iter()
            .map(|endpoint| endpoint.server_name().to_string())
            .collect()
    }

    /// Runs `query` on every server concurrently and gathers the
    /// per-server outcomes. Local queries are answered from the cluster
    /// view without touching any endpoint.
    pub async fn execute(&self, query: &ServersQuery) -> BTreeMap<String, QueryOutcome> {
        if query.is_local() {
            return self
                .server_names()
                .into_iter()
                .map(|name| {
                    let value = serde_json::Value::String(name.clone());
                    (name, QueryOutcome::Ok(value))
                })
                .collect();
        }
        let answers = join_all(self.endpoints.iter().map(|endpoint| async move {
            let name = endpoint.server_name().to_string();
            let outcome = match endpoint.execute(query).await {
                Ok(value) => QueryOutcome::Ok(value),
                Err(err) => {
                    tracing::warn!(server = %name, error = %err, "servers query endpoint failed");
                    QueryOutcome::Unavailable(err)
                }
            };
            (name, outcome)
        }))
        .await;
        answers.into_iter().collect()
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("servers", &self.server_names())
            .finish()
    }
}
