use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "careledger-cli")]
#[command(about = "CLI client for the healthcare audit ledger node")]
struct Cli {
    /// Node base URL (e.g. http://127.0.0.1:8080)
    #[arg(long, global = true, env = "CARELEDGER_NODE", default_value = "http://127.0.0.1:8080")]
    node: String,

    /// Bearer token for authenticated routes
    #[arg(long, global = true, env = "CARELEDGER_API_TOKEN")]
    token: Option<String>,

    /// Acting user sent as X-Actor-Id
    #[arg(long, global = true, env = "CARELEDGER_ACTOR")]
    actor: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Chain statistics
    Stats,
    /// Check whether a data hash is anchored and untampered
    Verify { data_hash: String },
    /// Full chain integrity scan
    Integrity,
    /// Fetch a block by hash, or by number with --number
    Block {
        id: String,
        #[arg(long)]
        number: bool,
    },
    /// List anchored transactions, newest first
    Transactions {
        #[arg(long)]
        record_type: Option<String>,
        #[arg(long)]
        actor_id: Option<String>,
        #[arg(long)]
        subject_id: Option<String>,
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        page: Option<usize>,
        #[arg(long)]
        page_size: Option<usize>,
        /// Only blocks anchored by --actor
        #[arg(long)]
        mine: bool,
    },
    /// Every block anchoring a record id
    History { record_id: String },
    /// Anchor a record
    Anchor {
        #[arg(long)]
        record_type: String,
        #[arg(long)]
        record_id: String,
        /// Record payload as JSON, or a plain string
        #[arg(long, conflicts_with = "data_file")]
        data: Option<String>,
        /// Read the payload from a JSON file
        #[arg(long)]
        data_file: Option<std::path::PathBuf>,
        #[arg(long)]
        subject_id: Option<String>,
        #[arg(long)]
        summary: Option<String>,
    },
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
struct AnchorBody {
    record_type: String,
    record_id: String,
    data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    subject_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
}

/// JSON when it parses, otherwise the raw text as a string payload.
fn parse_payload(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn transaction_query(
    record_type: Option<String>,
    actor_id: Option<String>,
    subject_id: Option<String>,
    search: Option<String>,
    page: Option<usize>,
    page_size: Option<usize>,
) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();
    let pairs = [
        ("recordType", record_type),
        ("actorId", actor_id),
        ("subjectId", subject_id),
        ("search", search),
        ("page", page.map(|p| p.to_string())),
        ("pageSize", page_size.map(|p| p.to_string())),
    ];
    for (key, value) in pairs {
        if let Some(value) = value {
            query.push((key, value));
        }
    }
    query
}

struct NodeClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
    actor: Option<String>,
}

impl NodeClient {
    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base.trim_end_matches('/'), path);
        debug!(%method, %url, "request");
        let mut builder = self.http.request(method, url);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        if let Some(actor) = &self.actor {
            builder = builder.header("X-Actor-Id", actor);
        }
        builder
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<Value> {
        let res = builder.send().await.context("node unreachable")?;
        let status = res.status();
        let body: Value = res.json().await.context("node sent a non-JSON response")?;
        if !status.is_success() {
            let message = body["error"].as_str().unwrap_or("request failed");
            let retry = if body["retryable"] == true { " (retryable)" } else { "" };
            bail!("{status}: {message}{retry}");
        }
        Ok(body)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .pretty()
        .init();

    let cli = Cli::parse();
    let client = NodeClient {
        http: reqwest::Client::new(),
        base: cli.node,
        token: cli.token,
        actor: cli.actor,
    };
    let get = reqwest::Method::GET;

    let body = match cli.cmd {
        Command::Stats => client.send(client.request(get, "/ledger/stats")).await?,
        Command::Verify { data_hash } => {
            client
                .send(client.request(get, &format!("/ledger/verify/{data_hash}")))
                .await?
        }
        Command::Integrity => client.send(client.request(get, "/ledger/integrity")).await?,
        Command::Block { id, number } => {
            let path = if number {
                let number: u64 = id.parse().context("block number must be an integer")?;
                format!("/ledger/blocks/{number}")
            } else {
                format!("/ledger/block/{id}")
            };
            client.send(client.request(get, &path)).await?
        }
        Command::Transactions {
            record_type,
            actor_id,
            subject_id,
            search,
            page,
            page_size,
            mine,
        } => {
            let path = if mine { "/ledger/my-transactions" } else { "/ledger/transactions" };
            let query =
                transaction_query(record_type, actor_id, subject_id, search, page, page_size);
            client.send(client.request(get, path).query(&query)).await?
        }
        Command::History { record_id } => {
            client
                .send(client.request(get, &format!("/ledger/records/{record_id}")))
                .await?
        }
        Command::Anchor {
            record_type,
            record_id,
            data,
            data_file,
            subject_id,
            summary,
        } => {
            let data = match (data, data_file) {
                (Some(raw), _) => parse_payload(&raw),
                (None, Some(path)) => {
                    let raw = tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("reading {}", path.display()))?;
                    serde_json::from_str(&raw)
                        .with_context(|| format!("{} is not valid JSON", path.display()))?
                }
                (None, None) => bail!("one of --data or --data-file is required"),
            };
            let body = AnchorBody {
                record_type,
                record_id,
                data,
                subject_id,
                summary,
            };
            client
                .send(client.request(reqwest::Method::POST, "/ledger/anchor").json(&body))
                .await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
