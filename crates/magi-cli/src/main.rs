//! Command-line front end for the MAGI decision core.
//!
//! Runs against the in-memory transport, so each invocation is a fresh
//! world: `ask` creates a conversation, sends the question through the
//! agent pipeline, and prints SOLOMON's verdict as JSON.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;

use magi_core::logging::init_tracing;
use magi_core::{CoreConfig, CoreRuntime, TransportClient};

#[derive(Parser)]
#[command(name = "magi", version, about = "Put questions to the three sages")]
struct Cli {
    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pretty: bool,

    /// User id operations are scoped to
    #[arg(long, global = true, default_value = "local-user")]
    user: String,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ask a question and print the decision
    Ask {
        question: String,

        /// Title for the conversation holding this exchange
        #[arg(long, default_value = "cli session")]
        title: String,

        /// Seconds to wait for the verdict
        #[arg(long, default_value_t = 30)]
        timeout: u64,

        /// Include the execution trace in the output
        #[arg(long)]
        trace: bool,
    },
}

fn print_json(value: &serde_json::Value, pretty: bool) -> Result<()> {
    if pretty {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", serde_json::to_string(value)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing("magi=info,magi_core=info", cli.log_file.as_deref())?;

    let runtime = CoreRuntime::from_config(CoreConfig::default(), &cli.user)?;

    match cli.command {
        Command::Ask {
            question,
            title,
            timeout,
            trace,
        } => {
            let conversation = runtime.create_conversation(title).await?;
            let reply = runtime
                .ask(&conversation.id, &question, Duration::from_secs(timeout))
                .await?;

            let mut output = json!({
                "conversationId": conversation.id,
                "question": question,
                "decision": reply.judge_response,
                "agentResponses": reply.agent_responses,
            });
            if trace {
                let steps = runtime.client().list_trace_steps(&reply.id).await?;
                output["trace"] = serde_json::to_value(steps)?;
            }
            print_json(&output, cli.pretty)?;
        }
    }

    runtime.shutdown();
    Ok(())
}
