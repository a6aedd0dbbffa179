//! backflow-bench: echo benchmark over an in-memory transport.
//!
//! A peer task delivers messages only against granted credit while a
//! server-role call echoes them back. The report shows throughput, the
//! call's counters and the highest number of credits ever outstanding.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use backflow::call::serve_bidi;
use backflow::flow::stats::FlowStats;
use backflow::loopback::LoopbackTransport;
use backflow::observability::metrics::init_metrics_with_endpoint;
use backflow::observability::tracing::{init_tracing_with_format, LogFormat};
use backflow::{FlowConfig, InboundStream, OutboundSink};
use clap::Parser;
use serde::Serialize;
use tokio::signal;

/// Echo benchmark for credit-paced streaming calls.
#[derive(Parser, Debug)]
#[command(name = "backflow-bench")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of messages the peer sends
    #[arg(short, long, env = "BACKFLOW_BENCH_MESSAGES", default_value_t = 10_000)]
    messages: u64,

    /// Artificial per-message delay in the handler, in microseconds
    #[arg(long, default_value_t = 0)]
    consumer_delay_us: u64,

    #[command(flatten)]
    flow: FlowConfig,

    /// Log format (text, json)
    #[arg(long, default_value = "text")]
    log_format: OutputFormat,

    /// Report format (text, json)
    #[arg(short, long, default_value = "text")]
    output: OutputFormat,

    /// OpenTelemetry OTLP endpoint for metrics export
    #[arg(long, env = "BACKFLOW_OTEL_ENDPOINT")]
    otel_endpoint: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown output format: {}", s)),
        }
    }
}

#[derive(Serialize)]
struct Report {
    messages: u64,
    echoed: usize,
    interrupted: bool,
    elapsed_ms: u128,
    messages_per_sec: f64,
    max_outstanding_credit: u64,
    credit_violations: u64,
    stats: FlowStats,
    config: FlowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_format = match cli.log_format {
        OutputFormat::Text => LogFormat::Text,
        OutputFormat::Json => LogFormat::Json,
    };
    init_tracing_with_format("backflow-bench", log_format);
    init_metrics_with_endpoint(cli.otel_endpoint.as_deref());

    let transport = LoopbackTransport::<u64, u64>::new();
    let delay = Duration::from_micros(cli.consumer_delay_us);
    let handler = move |mut inbound: InboundStream<u64>, outbound: OutboundSink<u64>| async move {
        while let Some(value) = inbound.recv().await? {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            outbound.send(value).await?;
        }
        Ok::<(), anyhow::Error>(())
    };

    let started = Instant::now();
    let control = serve_bidi(transport.clone(), cli.flow.clone(), handler);
    let peer = spawn_peer(transport.clone(), cli.messages);

    let interrupted = tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("interrupted, cancelling call");
            control.cancel();
            true
        }
        () = transport.finished() => false,
    };

    control.join().await;
    peer.await.context("peer task failed")?;
    let elapsed = started.elapsed();

    let echoed = transport.sent_count();
    let report = Report {
        messages: cli.messages,
        echoed,
        interrupted,
        elapsed_ms: elapsed.as_millis(),
        messages_per_sec: echoed as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        max_outstanding_credit: transport.max_outstanding_credit(),
        credit_violations: transport.credit_violations(),
        stats: control.stats(),
        config: cli.flow,
    };

    match cli.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_text(&report),
    }

    if let Some(status) = transport.closed_status().filter(|_| !interrupted) {
        anyhow::bail!("call failed: {}", status.message());
    }
    Ok(())
}

/// Deliver `count` messages against granted credit, then complete.
fn spawn_peer(
    transport: Arc<LoopbackTransport<u64, u64>>,
    count: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        for value in 0..count {
            transport.deliver_with_credit(value).await;
        }
        transport.complete();
    })
}

fn print_text(report: &Report) {
    println!(
        "echoed {}/{} messages in {} ms ({:.0} msg/s){}",
        report.echoed,
        report.messages,
        report.elapsed_ms,
        report.messages_per_sec,
        if report.interrupted { " [interrupted]" } else { "" }
    );
    println!(
        "credit: requested={} max_outstanding={} violations={}",
        report.stats.credits_requested, report.max_outstanding_credit, report.credit_violations
    );
    println!(
        "messages: received={} sent={} deferred={} late={}",
        report.stats.messages_received,
        report.stats.messages_sent,
        report.stats.deferred_enqueues,
        report.stats.late_deliveries
    );
    println!(
        "queues: inbound={} outbound={}",
        report.config.inbound_capacity, report.config.outbound_capacity
    );
}
