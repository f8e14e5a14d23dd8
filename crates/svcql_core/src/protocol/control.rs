//! Remote control of running queries.
//!
//! A request is a single length prefixed string `[ <verb> <arg> ]`. Known
//! verbs get a length prefixed `true` or `false` reply, anything else is
//! dropped without a reply.
use std::fmt;

use svcql_error::{DbError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::cache::ExecutorCache;

const MAX_REQUEST_LEN: u32 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Stop the query and remove it from the cache.
    Stop(String),
    /// Check if the query has errors.
    Errors(String),
}

impl ControlCommand {
    /// Parse a command envelope. Returns `None` for malformed envelopes and
    /// unknown verbs.
    pub fn parse(s: &str) -> Option<Self> {
        let inner = s.trim().strip_prefix('[')?.strip_suffix(']')?;
        let mut parts = inner.split_whitespace();
        let verb = parts.next()?;
        let arg = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        match verb {
            "stop" => Some(ControlCommand::Stop(arg.to_string())),
            "errors" => Some(ControlCommand::Errors(arg.to_string())),
            _ => None,
        }
    }

    /// If the string looks like a command envelope, known verb or not.
    pub fn is_envelope(s: &str) -> bool {
        let s = s.trim();
        s.starts_with('[') && s.ends_with(']')
    }

    pub fn id(&self) -> &str {
        match self {
            ControlCommand::Stop(id) | ControlCommand::Errors(id) => id,
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlCommand::Stop(id) => write!(f, "[ stop {id} ]"),
            ControlCommand::Errors(id) => write!(f, "[ errors {id} ]"),
        }
    }
}

/// Execute a command against the cache.
pub fn handle_command(cache: &ExecutorCache, command: &ControlCommand) -> bool {
    match command {
        ControlCommand::Stop(id) => match cache.executor(id) {
            Some(orchestrator) => {
                info!(%id, "stopping query");
                orchestrator.stop();
                cache.remove_executor(id);
                true
            }
            None => false,
        },
        ControlCommand::Errors(id) => cache
            .executor(id)
            .map(|orchestrator| orchestrator.has_errors())
            .unwrap_or(false),
    }
}

pub async fn read_string_async<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let len = reader.read_u32().await?;
    if len > MAX_REQUEST_LEN {
        return Err(DbError::new(format!("Request length {len} exceeds maximum")));
    }
    let mut buf = vec![0; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(String::from_utf8(buf)?)
}

pub async fn write_string_async<W: AsyncWrite + Unpin>(writer: &mut W, s: &str) -> Result<()> {
    writer.write_u32(s.len() as u32).await?;
    writer.write_all(s.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reply to an already read request. Returns the reply if one was sent.
pub async fn reply_to_request<W: AsyncWrite + Unpin>(
    cache: &ExecutorCache,
    request: &str,
    writer: &mut W,
) -> Result<Option<bool>> {
    let command = match ControlCommand::parse(request) {
        Some(command) => command,
        None => {
            debug!(%request, "ignoring unknown control request");
            return Ok(None);
        }
    };
    let reply = handle_command(cache, &command);
    debug!(%command, %reply, "handled control request");
    write_string_async(writer, if reply { "true" } else { "false" }).await?;
    Ok(Some(reply))
}

/// Read one request from the stream and reply to it.
pub async fn serve_control_request<S>(cache: &ExecutorCache, stream: &mut S) -> Result<Option<bool>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = read_string_async(stream).await?;
    reply_to_request(cache, &request, stream).await
}

/// Send a command and wait for the reply.
///
/// Returns `None` if the other side closed the stream without replying.
pub async fn send_control_command<S>(stream: &mut S, command: &ControlCommand) -> Result<Option<bool>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_string_async(stream, &command.to_string()).await?;
    let reply = match read_string_async(stream).await {
        Ok(reply) => reply,
        Err(_) => return Ok(None),
    };
    match reply.as_str() {
        "true" => Ok(Some(true)),
        "false" => Ok(Some(false)),
        other => Err(DbError::new(format!("Unexpected control reply: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_commands() {
        assert_eq!(
            Some(ControlCommand::Stop("abc".to_string())),
            ControlCommand::parse("[ stop abc ]")
        );
        assert_eq!(
            Some(ControlCommand::Errors("abc".to_string())),
            ControlCommand::parse("[errors abc]")
        );
        assert_eq!(None, ControlCommand::parse("[ restart abc ]"));
        assert_eq!(None, ControlCommand::parse("[ stop ]"));
        assert_eq!(None, ControlCommand::parse("stop abc"));
        assert_eq!(None, ControlCommand::parse("[ stop a b ]"));
    }

    #[test]
    fn display_round_trips() {
        let command = ControlCommand::Stop("q-1".to_string());
        assert_eq!("[ stop q-1 ]", command.to_string());
        assert_eq!(Some(command.clone()), ControlCommand::parse(&command.to_string()));
        assert!(ControlCommand::is_envelope("[ anything ]"));
        assert!(!ControlCommand::is_envelope("SELECT 1"));
    }

    #[test]
    fn missing_ids_reply_false() {
        let cache = ExecutorCache::default();
        assert!(!handle_command(&cache, &ControlCommand::Stop("nope".to_string())));
        assert!(!handle_command(&cache, &ControlCommand::Errors("nope".to_string())));
    }

    #[tokio::test]
    async fn unknown_verb_gets_no_reply() {
        let cache = ExecutorCache::default();
        let (mut client, mut server) = tokio::io::duplex(1024);

        let server = async move {
            let reply = serve_control_request(&cache, &mut server).await.unwrap();
            assert_eq!(None, reply);
        };
        let client = async move {
            write_string_async(&mut client, "[ restart x ]").await.unwrap();
            let mut buf = Vec::new();
            client.read_to_end(&mut buf).await.unwrap();
            assert!(buf.is_empty());
        };
        tokio::join!(server, client);
    }
}
