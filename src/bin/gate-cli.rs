use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "gate-cli")]
#[command(about = "Call RPC endpoints through the gateway", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,

    #[arg(short, long, default_value = "/rpc")]
    prefix: String,

    /// Auth token, sent in `--header`.
    #[arg(short, long, env = "RPC_GATE_TOKEN")]
    token: Option<String>,

    #[arg(long, default_value = "authtoken")]
    header: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// POST a JSON body to {prefix}/{service}/{endpoint}
    Call {
        service: String,
        endpoint: String,
        /// Request body; defaults to {}
        #[arg(default_value = "{}")]
        body: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(token) = &cli.token {
        headers.insert(HeaderName::from_bytes(cli.header.as_bytes())?, HeaderValue::from_str(token)?);
    }

    match cli.command {
        Commands::Call { service, endpoint, body } => {
            let body: Value = serde_json::from_str(&body)?;
            let url = format!(
                "{}{}/{}/{}",
                cli.url.trim_end_matches('/'),
                cli.prefix.trim_end_matches('/'),
                service,
                endpoint
            );
            let res = client
                .post(url)
                .headers(headers)
                .body(serde_json::to_vec(&body)?)
                .send()
                .await?;
            print_response(res).await?;
        }
    }

    Ok(())
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let text = res.text().await?;
    let rendered = match serde_json::from_str::<Value>(&text) {
        Ok(json) => serde_json::to_string_pretty(&json)?,
        Err(_) => text,
    };
    if status.is_success() {
        println!("{rendered}");
    } else {
        eprintln!("Error: gateway returned status {status}");
        eprintln!("{rendered}");
    }
    Ok(())
}
