use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use svcql_core::cache::ExecutorCache;
use svcql_core::config::ExecutionConfig;
use svcql_core::execution::QueryOrchestrator;
use svcql_core::protocol::ControlCommand;
use svcql_core::protocol::control::{read_string_async, reply_to_request};
use svcql_core::query::SqlQuery;
use svcql_core::types::Parameters;
use svcql_error::{OptionExt, Result, ResultExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::services::ServiceCatalog;

/// How often pending cache maintenance runs, evicting idle entries.
const CACHE_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Builds and runs queries against a service catalog.
#[derive(Debug)]
pub struct QueryHandler {
    catalog: ServiceCatalog,
    config: ExecutionConfig,
    cache: Arc<ExecutorCache>,
}

impl QueryHandler {
    pub fn new(catalog: ServiceCatalog, config: ExecutionConfig, cache: Arc<ExecutorCache>) -> Self {
        QueryHandler {
            catalog,
            config,
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<ExecutorCache> {
        &self.cache
    }

    pub fn build(
        &self,
        sql: &str,
        row_limit: Option<i64>,
        parameters: &Parameters,
    ) -> Result<Arc<QueryOrchestrator>> {
        let query = SqlQuery::parse(sql)?;
        let name = query.service_name().required("service name in FROM clause")?;
        let service = self.catalog.get(name)?;

        let mut builder =
            QueryOrchestrator::builder(sql, service.descriptor(), self.cache.clone())
                .source_graph(service.source_graph()?)
                .config(self.config.clone())
                .window(service.definition.window)
                .parameters(parameters);
        if let Some(limit) = row_limit {
            builder = builder.row_limit(limit);
        }
        builder.build()
    }

    /// Run a query to completion, writing the binary result to `writer`.
    pub fn execute<W>(
        &self,
        sql: &str,
        row_limit: Option<i64>,
        parameters: &Parameters,
        writer: W,
    ) -> Result<W>
    where
        W: Write + Send + 'static,
    {
        let orchestrator = self.build(sql, row_limit, parameters)?;
        info!(id = %orchestrator.id(), service = %orchestrator.service().name, "executing query");
        let result = orchestrator.execute_binary(writer);
        self.cache.remove_executor(orchestrator.id());
        result
    }
}

/// TCP server for the query and remote control protocols.
///
/// Each connection sends one length prefixed request. A `[ verb arg ]`
/// envelope is a control command, anything else is SQL answered with the
/// binary row stream. Rows are written to the connection as they're
/// produced. The query's id is the generated run id in the preamble, so a
/// client can stop it from another connection.
#[derive(Debug)]
pub struct Server {
    handler: Arc<QueryHandler>,
    listener: TcpListener,
}

impl Server {
    pub async fn bind(handler: Arc<QueryHandler>, addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .context_fn(|| format!("Failed to bind to {addr}"))?;
        Ok(Server { handler, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "listening");

        let cache = self.handler.cache().clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CACHE_MAINTENANCE_INTERVAL);
            loop {
                interval.tick().await;
                let cache = cache.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || cache.run_pending_tasks()).await {
                    warn!(error = %e, "cache maintenance failed");
                }
            }
        });

        loop {
            let (conn, addr) = self.listener.accept().await?;
            let handler = self.handler.clone();
            tokio::spawn(async move {
                debug!(%addr, "accepted connection");
                if let Err(e) = handle_connection(handler, conn).await {
                    warn!(%addr, error = %e, "connection failed");
                }
            });
        }
    }
}

async fn handle_connection(handler: Arc<QueryHandler>, mut conn: TcpStream) -> Result<()> {
    let request = read_string_async(&mut conn).await?;
    if ControlCommand::is_envelope(&request) {
        reply_to_request(handler.cache(), &request, &mut conn).await?;
        return Ok(());
    }

    // Queries write from graph threads, hand them a blocking socket.
    let conn = conn.into_std()?;
    conn.set_nonblocking(false)?;
    let conn = tokio::task::spawn_blocking(move || {
        handler.execute(&request, None, &Parameters::new(), conn)
    })
    .await
    .context("Query task failed")??;
    debug!(peer = ?conn.peer_addr().ok(), "query connection done");
    Ok(())
}
