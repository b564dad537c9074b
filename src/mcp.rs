use std::{sync::Arc, time::Duration};

use rmcp::{
    ServerHandler,
    ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{
        CallToolResult,
        Content,
        Implementation,
        ServerCapabilities,
        ServerInfo,
    },
    tool,
    tool_handler,
    tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    data_dir::DataDir,
    error::{self, Error},
    generation::{self, ChatClient},
    search::{
        DEFAULT_TOP_K,
        ResultSource,
        ScoredChunk,
        SearchEngine,
        SearchOutcome,
        SearchRequest,
    },
    settings::Settings,
};

struct ThreadsearchState {
    engine: Arc<SearchEngine>,
    chat: Option<ChatClient>,
    timeout: Duration,
}

#[derive(Clone)]
pub struct ThreadsearchMcpServer {
    state: Arc<ThreadsearchState>,
    tool_router: ToolRouter<Self>,
}

impl ThreadsearchMcpServer {
    fn new(state: ThreadsearchState) -> Self {
        Self {
            state: Arc::new(state),
            tool_router: Self::tool_router(),
        }
    }

    /// Run a search on the blocking pool, bounded by the request timeout.
    async fn run_search(
        &self,
        request: SearchRequest,
    ) -> Result<SearchOutcome, rmcp::ErrorData> {
        let engine = Arc::clone(&self.state.engine);
        let task = tokio::task::spawn_blocking(move || engine.execute(&request));

        match tokio::time::timeout(self.state.timeout, task).await {
            Err(_) => Err(rmcp::ErrorData::internal_error(
                format!("search timed out after {:?}", self.state.timeout),
                None,
            )),
            Ok(Err(join)) => Err(mcp_error("search task failed", join)),
            Ok(Ok(Err(e @ Error::InvalidQuery(_)))) => {
                Err(rmcp::ErrorData::invalid_params(e.to_string(), None))
            }
            Ok(Ok(Err(e))) => Err(mcp_error("search failed", e)),
            Ok(Ok(Ok(outcome))) => Ok(outcome),
        }
    }
}

#[tool_router(router = tool_router)]
impl ThreadsearchMcpServer {
    /// Semantic search over ingested email threads.
    #[tool(
        name = "threadsearch_search",
        description = "Search email thread excerpts by meaning. Returns the best matching chunks with relevance scores. Use threadId to restrict to one thread."
    )]
    pub async fn threadsearch_search(
        &self,
        params: Parameters<SearchParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let query = params.query.clone();
        let outcome = self.run_search(params.into_request()).await?;

        let items = to_items(&outcome.results);
        let summary = format_search_summary(&items, &query);
        let structured = serde_json::to_value(SearchResponse {
            query,
            result_count: items.len(),
            source: outcome.source,
            results: items,
        })
        .map_err(|e| mcp_error("failed to serialize search results", e))?;

        let mut result = CallToolResult::success(vec![Content::text(summary)]);
        result.structured_content = Some(structured);
        Ok(result)
    }

    /// Answer a question from the most relevant email excerpts.
    #[tool(
        name = "threadsearch_ask",
        description = "Answer a question about the email corpus. Retrieves relevant excerpts and summarizes them with a language model."
    )]
    pub async fn threadsearch_ask(
        &self,
        params: Parameters<SearchParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let Some(chat) = self.state.chat.as_ref() else {
            return Err(rmcp::ErrorData::invalid_request(
                "no language model configured; set THREADSEARCH_API_KEY or OPENAI_API_KEY",
                None,
            ));
        };

        let params = params.0;
        let query = params.query.clone();
        let outcome = self.run_search(params.into_request()).await?;
        let answer =
            generation::generate_answer(chat, &query, &outcome.results).await;

        let structured = serde_json::to_value(AskResponse {
            query,
            answer: answer.clone(),
            sources: to_items(&outcome.results),
        })
        .map_err(|e| mcp_error("failed to serialize answer", e))?;

        let mut result = CallToolResult::success(vec![Content::text(answer)]);
        result.structured_content = Some(structured);
        Ok(result)
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for ThreadsearchMcpServer {
    fn get_info(&self) -> ServerInfo {
        let mut server_info = Implementation::new(
            "threadsearch".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        server_info.title = Some("threadsearch MCP".to_string());
        server_info.icons = None;
        server_info.website_url = None;

        let mut info = ServerInfo::default();
        info.capabilities = ServerCapabilities::builder().enable_tools().build();
        info.server_info = server_info;
        info.instructions = Some(
            "Use threadsearch_search to find email excerpts by meaning and threadsearch_ask for a summarized answer. Pass threadId to stay within one thread."
                .to_string(),
        );
        info
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    /// Natural-language query.
    pub query: String,
    /// Maximum number of results (default: 5).
    pub top_k: Option<usize>,
    /// Only search chunks from this thread.
    pub thread_id: Option<u64>,
}

impl SearchParams {
    fn into_request(self) -> SearchRequest {
        SearchRequest::new(self.query)
            .top_k(self.top_k.unwrap_or(DEFAULT_TOP_K))
            .thread(self.thread_id)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    query: String,
    result_count: usize,
    source: ResultSource,
    results: Vec<SearchResultItem>,
}

#[derive(Debug, Serialize)]
struct AskResponse {
    query: String,
    answer: String,
    sources: Vec<SearchResultItem>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchResultItem {
    rank: usize,
    score: f32,
    thread_id: u64,
    subject: String,
    from: String,
    timestamp: String,
    chunk: String,
}

fn to_items(results: &[ScoredChunk]) -> Vec<SearchResultItem> {
    results
        .iter()
        .enumerate()
        .map(|(i, r)| SearchResultItem {
            rank: i + 1,
            score: r.score,
            thread_id: r.metadata.thread_id,
            subject: r.metadata.subject.clone(),
            from: r.metadata.sender.clone(),
            timestamp: r.metadata.timestamp.clone(),
            chunk: r.chunk.clone(),
        })
        .collect()
}

fn format_search_summary(results: &[SearchResultItem], query: &str) -> String {
    if results.is_empty() {
        return format!("No results found for \"{query}\"");
    }

    let mut lines = Vec::with_capacity(results.len() + 1);
    let suffix = if results.len() == 1 { "" } else { "s" };
    lines.push(format!(
        "Found {} result{} for \"{query}\":",
        results.len(),
        suffix
    ));

    for item in results {
        lines.push(format!(
            "{}. {:.3} thread {} | {} | {}",
            item.rank, item.score, item.thread_id, item.subject, item.from
        ));
    }

    lines.join("\n")
}

fn mcp_error(message: &str, error: impl std::fmt::Display) -> rmcp::ErrorData {
    rmcp::ErrorData::internal_error(
        message.to_string(),
        Some(json!({ "error": error.to_string() })),
    )
}

pub fn run_mcp(data_dir: DataDir, settings: Settings) -> error::Result<()> {
    let engine = SearchEngine::open(&data_dir, &settings)?;
    let chat = match ChatClient::from_settings(&settings) {
        Ok(chat) => Some(chat),
        Err(e) => {
            tracing::warn!(error = %e, "threadsearch_ask disabled");
            None
        }
    };

    let server = ThreadsearchMcpServer::new(ThreadsearchState {
        engine: Arc::new(engine),
        chat,
        timeout: settings.request_timeout,
    });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Config(format!("failed to start tokio runtime: {e}")))?;

    runtime.block_on(async move {
        let transport = rmcp::transport::stdio();
        let running = server.serve(transport).await.map_err(|e| {
            Error::Config(format!("MCP server initialization failed: {e}"))
        })?;
        running
            .waiting()
            .await
            .map_err(|e| Error::Config(format!("MCP server error: {e}")))?;
        Ok(())
    })
}
