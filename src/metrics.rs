use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use std::thread;
use tracing::{error, info};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn counter(name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).expect("valid counter definition");
    REGISTRY.register(Box::new(c.clone())).expect("counter registered once");
    c
}

// Prefix metrics with `ledger_` for namespacing.
pub static BLOCKS_MINED: Lazy<IntCounter> =
    Lazy::new(|| counter("ledger_blocks_mined_total", "Blocks appended to the chain"));
pub static TX_CONFIRMED: Lazy<IntCounter> =
    Lazy::new(|| counter("ledger_transactions_confirmed_total", "Pending transactions confirmed by mining"));
pub static TX_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    counter("ledger_transactions_dropped_total", "Pending transactions skipped at mining time")
});
pub static TX_SUBMITTED: Lazy<IntCounter> =
    Lazy::new(|| counter("ledger_transactions_submitted_total", "Transfers accepted into the pending pool"));
pub static POW_ATTEMPTS: Lazy<IntCounter> =
    Lazy::new(|| counter("ledger_pow_attempts_total", "Nonces hashed during proof-of-work"));
pub static POW_SEARCH_MS: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(
        HistogramOpts::new("ledger_pow_search_ms", "Wall time of one proof-of-work search")
            .buckets(vec![1.0, 10.0, 100.0, 1_000.0, 10_000.0, 60_000.0]),
    )
    .expect("valid histogram definition");
    REGISTRY.register(Box::new(h.clone())).expect("histogram registered once");
    h
});

/// Text exposition of every registered metric.
pub fn render() -> Result<Vec<u8>> {
    let mut buffer = vec![];
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(buffer)
}

pub fn serve(cfg: crate::config::Metrics) -> Result<()> {
    // Touch the statics so the families show up before the first block.
    Lazy::force(&BLOCKS_MINED);
    Lazy::force(&TX_CONFIRMED);
    Lazy::force(&TX_DROPPED);
    Lazy::force(&TX_SUBMITTED);
    Lazy::force(&POW_ATTEMPTS);
    Lazy::force(&POW_SEARCH_MS);

    let server = tiny_http::Server::http(&cfg.bind)
        .map_err(|e| anyhow::anyhow!("could not start metrics server on {}: {}", cfg.bind, e))?;
    info!(bind = %cfg.bind, "metrics endpoint listening");

    thread::spawn(move || {
        for request in server.incoming_requests() {
            let buffer = match render() {
                Ok(b) => b,
                Err(e) => {
                    error!("could not encode metrics: {e}");
                    continue;
                }
            };
            let mut response = tiny_http::Response::from_data(buffer);
            if let Ok(header) = "Content-Type: text/plain; version=0.0.4; charset=utf-8".parse::<tiny_http::Header>() {
                response = response.with_header(header);
            }
            let _ = request.respond(response);
        }
    });

    Ok(())
}
