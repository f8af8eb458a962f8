//! FEP Server - the gateway binary
//!
//! Accepts length-prefixed ISO-8583 frames from acquiring channels over
//! TCP, runs each request through the transaction pipeline, and answers
//! on the same socket. The interbank side is the dual-channel FISC link.
//!
//! Configuration is environment-driven; see `env_config` for the
//! recognized keys (`FEP_LISTEN_ADDR`, `FEP_FISC_SEND_HOST`, ...).

use std::str::FromStr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fep_audit::{AuditLogger, InMemoryAuditSink};
use fep_codec::{MessageAssembler, MessageParser, SchemaRegistry};
use fep_connection::{framing, FiscConnection};
use fep_engine::{wire, Gateway, GatewayConfig, Validator};
use fep_router::{Destination, Router, RoutingRule};
use fep_security::{KeyManager, KeyType};
use fep_store::{InMemoryRepository, TransactionRepository};
use fep_types::{
    Channel, ConnectionConfig, EndpointConfig, FailureStrategy, SocketConfig, TransactionType,
};

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn socket_config(prefix: &str, default_port: u16) -> SocketConfig {
    let primary = EndpointConfig::new(
        env_str(&format!("{}_HOST", prefix), "127.0.0.1"),
        env_or(&format!("{}_PORT", prefix), default_port),
    );
    let mut config = SocketConfig::for_endpoint(primary);
    if let Ok(host) = std::env::var(format!("{}_BACKUP_HOST", prefix)) {
        config = config.with_backup(EndpointConfig::new(
            host,
            env_or(&format!("{}_BACKUP_PORT", prefix), default_port),
        ));
    }
    config.connect_timeout_ms = env_or("FEP_CONNECT_TIMEOUT_MS", 5_000);
    config.read_timeout_ms = env_or("FEP_READ_TIMEOUT_MS", 30_000);
    config
}

fn connection_config() -> ConnectionConfig {
    let institution = env_str("FEP_INSTITUTION_ID", "8220000");
    let send = socket_config("FEP_FISC_SEND", 7101);
    let receive = socket_config("FEP_FISC_RECEIVE", 7102);
    let mut config = match env_str("FEP_CHANNEL_MODE", "dual").as_str() {
        "single" => ConnectionConfig::single(institution.clone(), send),
        _ => ConnectionConfig::dual(institution.clone(), send, receive),
    };
    config.channel_id = env_str("FEP_CHANNEL_ID", "fisc");
    config.heartbeat_interval_ms = env_or("FEP_HEARTBEAT_INTERVAL_MS", 30_000);
    config.graceful_shutdown_timeout_ms = env_or("FEP_GRACEFUL_SHUTDOWN_TIMEOUT_MS", 10_000);
    config.auto_connect = env_or("FEP_AUTO_CONNECT", true);
    config.auto_sign_on = env_or("FEP_AUTO_SIGN_ON", true);
    config.failure_strategy = match env_str("FEP_FAILURE_STRATEGY", "both_down").as_str() {
        "any_down" => FailureStrategy::FailWhenAnyDown,
        "fallback_single" => FailureStrategy::FallbackToSingle,
        _ => FailureStrategy::FailWhenBothDown,
    };
    config
}

fn default_router() -> Router {
    let fisc_timeout = env_or("FEP_FISC_TIMEOUT_MS", 10_000);
    Router::new()
        .add_rule(
            RoutingRule::new("bill-payments", 10, Destination::FiscBillPayment)
                .for_types([TransactionType::BillPayment])
                .with_timeout_ms(fisc_timeout),
        )
        .add_rule(
            RoutingRule::new("interbank-financial", 20, Destination::FiscInterbank)
                .for_types([
                    TransactionType::Withdrawal,
                    TransactionType::Deposit,
                    TransactionType::Transfer,
                    TransactionType::Purchase,
                    TransactionType::BalanceInquiry,
                    TransactionType::Reversal,
                ])
                .with_timeout_ms(fisc_timeout),
        )
        .with_default(Destination::FiscInterbank, fisc_timeout)
}

/// One acquiring-channel connection: frames in, responses out
async fn serve_channel(stream: TcpStream, gateway: Arc<Gateway>, registry: Arc<SchemaRegistry>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let schema = registry.get("fisc").expect("fisc schema registered");
    let (mut read_half, mut write_half) = stream.into_split();
    info!(peer = %peer, "channel connected");

    loop {
        let frame = match framing::read_frame(&mut read_half).await {
            Ok(f) => f,
            Err(e) => {
                info!(peer = %peer, reason = %e, "channel disconnected");
                return;
            }
        };
        let message = match MessageParser::new(&schema).parse(&frame) {
            Ok(m) => m,
            Err(e) => {
                warn!(peer = %peer, error = %e, "undecodable ingress frame dropped");
                continue;
            }
        };
        let request = match wire::decode_request(&message, Channel::Atm) {
            Ok(r) => r,
            Err(e) => {
                warn!(peer = %peer, error = %e, "ingress message missing mandatory fields");
                continue;
            }
        };

        let response = gateway.process(request).await;
        let reply = match wire::encode_response(&message, &response) {
            Ok(r) => r,
            Err(e) => {
                error!(peer = %peer, error = %e, "reply encode failed");
                continue;
            }
        };
        let bytes = match MessageAssembler::new(&schema).assemble(&reply) {
            Ok(b) => b,
            Err(e) => {
                error!(peer = %peer, error = %e, "reply assembly failed");
                continue;
            }
        };
        if let Err(e) = framing::write_frame(&mut write_half, &bytes).await {
            warn!(peer = %peer, error = %e, "reply write failed");
            return;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let registry = Arc::new(SchemaRegistry::with_fisc());
    let schema = registry.get("fisc").expect("fisc schema registered");

    // Working keys for the session; production imports under the KEK via
    // the HSM key-exchange flow instead
    let keys = Arc::new(KeyManager::new());
    for (key_type, label) in [
        (KeyType::Pek, "session PEK"),
        (KeyType::Mak, "session MAK"),
        (KeyType::Dek, "session DEK"),
    ] {
        let info = keys
            .generate_key(key_type, 16)
            .map_err(|e| anyhow::anyhow!("key bootstrap: {}", e))?;
        info!(key_id = %info.id, kcv = %info.kcv, label, "key ready");
    }

    let conn_config = connection_config();
    let auto_connect = conn_config.auto_connect;
    let connection = Arc::new(FiscConnection::new(conn_config, schema));
    if auto_connect {
        match connection.connect().await {
            Ok(()) => info!(state = %connection.state(), "FISC link up"),
            Err(e) => warn!(error = %e, "FISC link not established; continuing degraded"),
        }
    }

    let repository: Arc<dyn TransactionRepository> = Arc::new(InMemoryRepository::new());
    let audit = Arc::new(AuditLogger::new(Arc::new(InMemoryAuditSink::new())));
    let router = Arc::new(default_router());

    let gateway_config = GatewayConfig {
        our_bank: env_str("FEP_INSTITUTION_ID", "8220000"),
        dedup_window: chrono::Duration::hours(env_or("FEP_DEDUP_WINDOW_HOURS", 24)),
        reversal_window: chrono::Duration::hours(env_or("FEP_REVERSAL_WINDOW_HOURS", 24)),
        default_timeout_ms: env_or("FEP_FISC_TIMEOUT_MS", 10_000),
        require_mac: env_or("FEP_REQUIRE_MAC", false),
        ..GatewayConfig::default()
    };
    let gateway = Arc::new(Gateway::new(
        gateway_config,
        Arc::clone(&connection),
        keys,
        repository,
        router,
        audit,
        Validator::new(),
    ));

    let listen_addr = env_str("FEP_LISTEN_ADDR", "0.0.0.0:7000");
    let listener = TcpListener::bind(&listen_addr).await?;
    info!(addr = %listen_addr, "acquiring-channel ingress listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let gateway = Arc::clone(&gateway);
                        let registry = Arc::clone(&registry);
                        tokio::spawn(serve_channel(stream, gateway, registry));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    if let Err(e) = connection.close().await {
        warn!(error = %e, "FISC link close failed");
    }
    info!("gateway stopped");
    Ok(())
}
