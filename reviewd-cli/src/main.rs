use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

/// reviewd: administer the merge-request review service
#[derive(Parser, Debug)]
#[command(name = "reviewd")]
#[command(about = "Admin CLI for the reviewd service", long_about = None)]
struct Cli {
    /// Base URL of the reviewd server
    #[arg(long, default_value = "http://localhost:8080", global = true)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register a provider (lists and stores its repositories)
    CreateProvider(CreateProviderArgs),
    /// List registered providers
    ListProviders,
    /// Soft-delete a provider
    DeleteProvider(DeleteProviderArgs),
    /// List repositories of a provider
    ListRepos(ListReposArgs),
    /// Enable automatic reviews for a repository
    EnableReview(RepoArgs),
    /// Disable automatic reviews for a repository
    DisableReview(RepoArgs),
    /// Trigger a review for a merge request (bypasses dedup)
    TriggerReview(TriggerReviewArgs),
    /// Show a review run with its comments
    GetRun(GetRunArgs),
}

#[derive(Parser, Debug)]
struct CreateProviderArgs {
    /// Provider type
    #[arg(long, value_parser = ["gitlab_self_hosted", "gitlab_cloud"])]
    r#type: String,

    /// Display name
    #[arg(long)]
    name: String,

    /// Instance base URL (empty for gitlab.com)
    #[arg(long, default_value = "")]
    base_url: String,

    /// Access token (if not provided, will use GITLAB_TOKEN environment variable)
    #[arg(long)]
    token: Option<String>,
}

#[derive(Parser, Debug)]
struct DeleteProviderArgs {
    /// Provider id
    #[arg(long)]
    id: String,
}

#[derive(Parser, Debug)]
struct ListReposArgs {
    /// Provider id
    #[arg(long)]
    provider_id: String,
}

#[derive(Parser, Debug)]
struct RepoArgs {
    /// Repository id
    #[arg(long)]
    repo_id: String,
}

#[derive(Parser, Debug)]
struct TriggerReviewArgs {
    /// Repository id
    #[arg(long)]
    repo_id: String,

    /// Merge request number (IID)
    #[arg(long)]
    mr_number: i64,
}

#[derive(Parser, Debug)]
struct GetRunArgs {
    /// Review run id
    #[arg(long)]
    id: String,
}

async fn rpc(server: &str, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
    let url = format!("{}/rpc/{}", server.trim_end_matches('/'), path);
    let response = reqwest::Client::new()
        .post(&url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("calling {}", url))?;

    let status = response.status();
    let value: serde_json::Value = response
        .json()
        .await
        .context("reading server response")?;

    if !status.is_success() {
        let code = value["code"].as_str().unwrap_or("unknown");
        let message = value["message"].as_str().unwrap_or("");
        bail!("server returned {} ({}): {}", status, code, message);
    }
    Ok(value)
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let server = cli.server.clone();

    let result = match cli.command {
        Commands::CreateProvider(args) => {
            let token = match args.token {
                Some(t) => t,
                None => std::env::var("GITLAB_TOKEN")
                    .context("provide --token or set GITLAB_TOKEN")?,
            };
            rpc(
                &server,
                "providers/create",
                json!({
                    "type": args.r#type,
                    "name": args.name,
                    "base_url": args.base_url,
                    "token": token,
                }),
            )
            .await?
        }
        Commands::ListProviders => rpc(&server, "providers/list", json!({})).await?,
        Commands::DeleteProvider(args) => {
            rpc(&server, "providers/delete", json!({"id": args.id})).await?
        }
        Commands::ListRepos(args) => {
            rpc(
                &server,
                "repositories/list",
                json!({"provider_id": args.provider_id}),
            )
            .await?
        }
        Commands::EnableReview(args) => {
            rpc(
                &server,
                "repositories/enable_review",
                json!({"repo_id": args.repo_id}),
            )
            .await?
        }
        Commands::DisableReview(args) => {
            rpc(
                &server,
                "repositories/disable_review",
                json!({"repo_id": args.repo_id}),
            )
            .await?
        }
        Commands::TriggerReview(args) => {
            rpc(
                &server,
                "reviews/trigger",
                json!({"repo_id": args.repo_id, "mr_number": args.mr_number}),
            )
            .await?
        }
        Commands::GetRun(args) => rpc(&server, "reviews/get", json!({"id": args.id})).await?,
    };

    print_json(&result)
}
