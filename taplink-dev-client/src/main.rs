//! Developer CLI for the TapLink SDK.
//!
//! Connects to a Tapro terminal (real or emulated) and runs transactions
//! from the command line. Useful for poking at a terminal on the bench and
//! as a living example of the SDK surface.

use std::{sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use eyre::Context as _;
use rust_decimal::Decimal;
use taplink_client::{
    ConnectionConfig, ConnectionListener, DeviceInfo, DisconnectReason, SdkConfig, TapLinkSdk,
    TransactionCallback, TransactionResult,
};
use taplink_types::{
    error::TapError,
    event::PaymentEvent,
    request::{Amount, QueryTarget, RefundRequest, SaleRequest},
};
use tokio::sync::mpsc;

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Connect, print the device identity, disconnect.
    Ping,
    /// Run a sale.
    Sale {
        /// Order amount, e.g. `8.99`.
        #[clap(long)]
        amount: Decimal,
        /// ISO-4217 currency.
        #[clap(long, default_value = "USD")]
        currency: String,
        /// Merchant reference, 6-32 characters. Generated when omitted.
        #[clap(long)]
        reference: Option<String>,
    },
    /// Run a non-referenced refund.
    Refund {
        /// Refund amount.
        #[clap(long)]
        amount: Decimal,
        /// ISO-4217 currency.
        #[clap(long, default_value = "USD")]
        currency: String,
        /// Merchant reference of the refund.
        #[clap(long)]
        reference: String,
    },
    /// Query a transaction by its terminal-assigned id.
    Query {
        /// The transaction id to look up.
        #[clap(long)]
        transaction_id: String,
    },
    /// Start an emulated terminal and idle until interrupted.
    Emulate,
}

/// The configuration for the TapLink dev client.
///
/// It can be configured via environment variables or command line arguments
/// using `clap`.
#[derive(Parser, Debug)]
struct DevClientConfig {
    /// The terminal host.
    #[clap(long, env = "TAPLINK_DEV_CLIENT_HOST", default_value = "127.0.0.1")]
    host: String,

    /// The terminal port.
    #[clap(long, env = "TAPLINK_DEV_CLIENT_PORT", default_value = "8443")]
    port: u16,

    /// Use TLS (`wss`).
    #[clap(long, env = "TAPLINK_DEV_CLIENT_SECURE")]
    secure: bool,

    /// The merchant application id.
    #[clap(long, env = "TAPLINK_DEV_CLIENT_APP_ID", default_value = "taplink-dev")]
    app_id: String,

    /// The merchant secret.
    #[clap(long, env = "TAPLINK_DEV_CLIENT_SECRET", default_value = "dev-secret")]
    secret_key: String,

    /// Max time to wait for a transaction to finish.
    #[clap(
        long,
        env = "TAPLINK_DEV_CLIENT_WAIT_TIME",
        default_value = "3min",
        value_parser = humantime::parse_duration
    )]
    max_wait_time: Duration,

    /// Command
    #[command(subcommand)]
    command: Command,
}

struct LoggingListener;

impl ConnectionListener for LoggingListener {
    fn on_waiting_connect(&self) {
        tracing::info!("waiting for connection..");
    }

    fn on_connected(&self, device: &DeviceInfo) {
        tracing::info!("connected to {} (tapro {})", device.device_id, device.tapro_version);
    }

    fn on_disconnected(&self, reason: &DisconnectReason) {
        tracing::info!("disconnected: {reason:?}");
    }

    fn on_error(&self, error: &TapError) {
        tracing::error!("connection error: {error}");
    }
}

struct ChannelCallback {
    tx: mpsc::Sender<Result<TransactionResult, TapError>>,
}

impl TransactionCallback for ChannelCallback {
    fn on_success(&self, result: TransactionResult) {
        let _ = self.tx.try_send(Ok(result));
    }

    fn on_failure(&self, error: TapError) {
        let _ = self.tx.try_send(Err(error));
    }

    fn on_progress(&self, event: PaymentEvent, message: &str) {
        tracing::info!(
            "[{:>3}%] {} - {message}",
            event.progress_percent(),
            event.code()
        );
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,taplink_client=debug".into()),
        )
        .init();
    let config = DevClientConfig::parse();

    if let Command::Emulate = config.command {
        return emulate(&config).await;
    }

    let sdk = TapLinkSdk::init(SdkConfig {
        app_id: config.app_id.clone(),
        secret_key: config.secret_key.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    });
    let connection_config = ConnectionConfig::lan(config.host.clone(), config.port, config.secure);
    sdk.connect(Some(connection_config), Arc::new(LoggingListener))
        .await
        .map_err(|err| eyre::eyre!("cannot connect: {err}"))?;
    let device = sdk
        .device_info()
        .ok_or_else(|| eyre::eyre!("connected but no device info"))?;
    tracing::info!("terminal: {} ({})", device.device_id, device.tapro_version);

    match &config.command {
        Command::Ping => {}
        Command::Sale {
            amount,
            currency,
            reference,
        } => {
            let reference = reference.clone().unwrap_or_else(generated_reference);
            let request = SaleRequest {
                reference_order_id: reference,
                amount: Amount::order_only(*amount, currency.clone()),
                payment_method: None,
                staff: None,
                description: None,
                attach: None,
                notify_url: None,
                request_timeout: None,
            };
            let result = run_transaction(&config, |tx| async {
                sdk.payments()
                    .sale(request, Arc::new(ChannelCallback { tx }))
                    .await
            })
            .await?;
            tracing::info!("sale finished: {result:?}");
        }
        Command::Refund {
            amount,
            currency,
            reference,
        } => {
            let request = RefundRequest {
                original_transaction_id: None,
                original_transaction_request_id: None,
                reference_order_id: Some(reference.clone()),
                amount: Amount::order_only(*amount, currency.clone()),
            };
            let result = run_transaction(&config, |tx| async {
                sdk.payments()
                    .refund(request, Arc::new(ChannelCallback { tx }))
                    .await
            })
            .await?;
            tracing::info!("refund finished: {result:?}");
        }
        Command::Query { transaction_id } => {
            let target = QueryTarget::TransactionId(transaction_id.clone());
            let result = run_transaction(&config, |tx| async {
                sdk.payments()
                    .query(target, Arc::new(ChannelCallback { tx }))
                    .await
            })
            .await?;
            tracing::info!("query finished: {result:?}");
        }
        Command::Emulate => unreachable!("handled above"),
    }

    sdk.disconnect().await;
    Ok(())
}

async fn run_transaction<F, Fut>(
    config: &DevClientConfig,
    submit: F,
) -> eyre::Result<TransactionResult>
where
    F: FnOnce(mpsc::Sender<Result<TransactionResult, TapError>>) -> Fut,
    Fut: Future<
        Output = Result<taplink_types::TraceId, Vec<taplink_types::validation::ValidationError>>,
    >,
{
    let (tx, mut rx) = mpsc::channel(1);
    let trace_id = submit(tx)
        .await
        .map_err(|errors| eyre::eyre!("request rejected: {errors:?}"))?;
    tracing::info!("submitted as {trace_id}");
    let outcome = tokio::time::timeout(config.max_wait_time, rx.recv())
        .await
        .context("no terminal event before the deadline")?
        .ok_or_else(|| eyre::eyre!("callback dropped"))?;
    outcome.map_err(|err| eyre::eyre!("transaction failed: {err}"))
}

fn generated_reference() -> String {
    format!(
        "DEV-{}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
    )
}

async fn emulate(config: &DevClientConfig) -> eyre::Result<()> {
    let terminal =
        taplink_test_utils::EmulatedTerminal::spawn(taplink_test_utils::TerminalBehavior::default())
            .await?;
    tracing::info!(
        "emulated terminal at {}:{} - connect with --host {} --port {}",
        terminal.host(),
        terminal.port(),
        terminal.host(),
        terminal.port()
    );
    let _ = config;
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    terminal.shutdown();
    Ok(())
}
