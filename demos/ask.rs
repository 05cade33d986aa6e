use anyhow::Result;
use chat_relay::tools::{parse_tool_calls, tool_system_prompt, ToolDefinition};
use chat_relay::{BrowserConfig, ChatRelay, ChromiumSession, ExchangeRequest, RelayConfig, RelayWorker};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let question = args.next().unwrap_or_else(|| "What is the capital of France?".to_string());
    let images: Vec<PathBuf> = args.map(PathBuf::from).collect();

    let session = match std::env::var("CHROME_WS_URL") {
        Ok(ws) if !ws.trim().is_empty() => ChromiumSession::connect(&ws).await?,
        _ => ChromiumSession::launch(BrowserConfig::default()).await?,
    };
    let cfg = RelayConfig::default();
    let relay = Arc::new(ChatRelay::new(session, cfg));

    relay.new_chat().await?;
    if !relay.is_logged_in().await {
        eprintln!("not logged in; sign in once in the opened window and re-run with the same BROWSER_PROFILE_DIR");
    }

    let (handle, worker) = RelayWorker::spawn(relay.clone());

    // Optional: route the question through a single declared function.
    let request = if std::env::var("ASK_WITH_TOOLS").is_ok() {
        let tools = vec![ToolDefinition {
            name: "get_current_time".into(),
            description: "Current wall-clock time".into(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
        }];
        let text = format!("{}\n\nUser: {question}", tool_system_prompt(&tools));
        let reply = handle.send(ExchangeRequest::text(text)).await?;
        match parse_tool_calls(&reply.text, &tools) {
            Some(calls) => println!("{}", serde_json::to_string_pretty(&calls)?),
            None => println!("{}", serde_json::to_string_pretty(&reply)?),
        }
        None
    } else {
        Some(ExchangeRequest::text(question).with_images(images))
    };

    if let Some(request) = request {
        let reply = handle.send(request).await?;
        println!("{}", serde_json::to_string_pretty(&reply)?);
    }

    for thread in relay.list_threads().await?.into_iter().take(5) {
        println!("{}  {}", thread.id, thread.title);
    }

    drop(handle);
    worker.await?;
    Ok(())
}
