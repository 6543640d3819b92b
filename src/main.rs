use tickmux::config::fetch_config;
use tickmux::{ChannelType, MarketEvent, StreamClient, TickmuxError, Update};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), TickmuxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let app_config = fetch_config()?;
    let symbol = std::env::args().nth(1).unwrap_or_else(|| "BTC/USD".to_string());

    let mut client = StreamClient::new(app_config.client, app_config.profile.build());
    let mut book = client.watch(ChannelType::OrderBook, &symbol)?;
    let mut trades = client.watch(ChannelType::Trades, &symbol)?;
    client.connect()?;

    loop {
        tokio::select! {
            update = book.recv() => match update {
                Some(Update::Event(MarketEvent::Book(change))) => {
                    if let Some(current) = client.order_book(&change.symbol).await? {
                        info!(
                            symbol = %current.symbol,
                            best_bid = ?current.best_bid().map(|l| l.price),
                            best_ask = ?current.best_ask().map(|l| l.price),
                            "Book updated"
                        );
                    }
                }
                Some(Update::Event(_)) => {}
                Some(Update::Failed(failure)) => {
                    warn!(%failure, "Book stream failed");
                    client.close().await;
                    return Err(failure.into());
                }
                None => break,
            },
            update = trades.recv() => match update {
                Some(Update::Event(MarketEvent::Trades(batch))) => {
                    for trade in batch {
                        info!(symbol = %trade.symbol, price = %trade.price, amount = %trade.amount, "Trade");
                    }
                }
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    client.close().await;
    Ok(())
}
