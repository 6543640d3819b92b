//! Profile for exchanges that address channels by string topic.
//!
//! Topics are derived from the channel itself (`BTC/USD@orderbook`,
//! `ETH/USD@kline_1m`, `executionreport`), so no id handshake is needed and
//! data frames carry their topic. Book snapshots arrive on `@orderbook`,
//! incremental updates on `@orderbookupdate`; a fresh snapshot can be
//! requested in-band.
//!
//! ```text
//! -> {"id":"BTC/USD@orderbook","event":"subscribe","topic":"BTC/USD@orderbook"}
//! <- {"topic":"BTC/USD@orderbook","ts":1,"data":{"bids":[[100,1]],"asks":[]}}
//! <- {"topic":"BTC/USD@orderbookupdate","ts":2,"data":{"bids":[[100,0]],"asks":[]}}
//! <- {"event":"ping"}
//! -> {"event":"pong"}
//! ```

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{ExchangeProfile, Payload, Resnapshot, WireLevel, levels, str_field, symbol_of};
use crate::auth::{AuthScheme, Digest, LoginPayload, SecretEncoding, SignatureEncoding};
use crate::book::SequencePolicy;
use crate::models::{
    Balance, BookDelta, BookSide, BookSnapshot, Candle, Channel, ChannelId, ChannelType,
    LevelDelta, MarketEvent, Order, OrderStatus, Position, Side, Ticker, Trade,
};
use crate::registry::IdStrategy;
use crate::router::{Control, Frame};
use crate::{Result, TickmuxError};

const PONG: &str = r#"{"event":"pong"}"#;
const PING: &str = r#"{"event":"ping"}"#;
const BOOK_UPDATE_SUFFIX: &str = "@orderbookupdate";
const DEFAULT_INTERVAL: &str = "1m";

#[derive(Debug, Clone, Copy, Default)]
pub struct TopicProfile;

/// Derives the wire topic for a channel.
///
/// Account channels are not symbol-scoped on the wire and map to a single
/// topic each.
pub fn topic_of(channel: &Channel) -> ChannelId {
    let symbol = channel.symbol_or_empty();
    let topic = match channel.kind {
        ChannelType::Ticker => format!("{symbol}@ticker"),
        ChannelType::Trades => format!("{symbol}@trade"),
        ChannelType::OrderBook => format!("{symbol}@orderbook"),
        ChannelType::Candles => format!(
            "{symbol}@kline_{}",
            channel.param.as_deref().unwrap_or(DEFAULT_INTERVAL)
        ),
        ChannelType::Balance => "balance".into(),
        ChannelType::Orders => "executionreport".into(),
        ChannelType::MyTrades => "tradereport".into(),
        ChannelType::Positions => "position".into(),
    };
    ChannelId::Named(topic)
}

/// Best-effort inverse of [`topic_of`].
pub fn channel_of_topic(topic: &str) -> Option<Channel> {
    let Some((symbol, name)) = topic.rsplit_once('@') else {
        let kind = match topic {
            "balance" => ChannelType::Balance,
            "executionreport" => ChannelType::Orders,
            "tradereport" => ChannelType::MyTrades,
            "position" => ChannelType::Positions,
            _ => return None,
        };
        return Some(Channel::account(kind));
    };
    let channel = match name {
        "ticker" => Channel::new(ChannelType::Ticker, symbol),
        "trade" => Channel::new(ChannelType::Trades, symbol),
        "orderbook" | "orderbookupdate" => Channel::new(ChannelType::OrderBook, symbol),
        _ => {
            let interval = name.strip_prefix("kline_")?;
            Channel::new(ChannelType::Candles, symbol).with_param(interval)
        }
    };
    Some(channel)
}

/// Maps a data frame's topic onto the registry id of its channel.
fn normalize_topic(topic: &str) -> ChannelId {
    match topic.strip_suffix(BOOK_UPDATE_SUFFIX) {
        Some(symbol) => ChannelId::Named(format!("{symbol}@orderbook")),
        None => ChannelId::Named(topic.to_string()),
    }
}

#[derive(Serialize)]
struct TopicRequest<'a> {
    id: &'a str,
    event: &'static str,
    topic: &'a str,
}

#[derive(Deserialize)]
struct WireBook {
    #[serde(default)]
    bids: Vec<WireLevel>,
    #[serde(default)]
    asks: Vec<WireLevel>,
}

#[derive(Deserialize)]
struct WireTicker {
    bid: Option<Decimal>,
    ask: Option<Decimal>,
    #[serde(alias = "last")]
    close: Decimal,
    #[serde(default)]
    volume: Decimal,
}

#[derive(Deserialize)]
struct WireTrade {
    price: Decimal,
    size: Decimal,
    side: Side,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCandle {
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    #[serde(default)]
    volume: Decimal,
    start_time: Option<i64>,
}

#[derive(Deserialize)]
struct WireHolding {
    holding: Decimal,
    #[serde(default)]
    frozen: Decimal,
}

#[derive(Deserialize)]
struct WireBalances {
    balances: BTreeMap<String, WireHolding>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireExecution {
    symbol: String,
    order_id: Value,
    side: Side,
    price: Option<Decimal>,
    quantity: Decimal,
    #[serde(default)]
    executed_quantity: Decimal,
    status: String,
    timestamp: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFill {
    symbol: String,
    trade_id: Option<Value>,
    order_id: Option<Value>,
    side: Side,
    executed_price: Decimal,
    executed_quantity: Decimal,
    fee: Option<Decimal>,
    timestamp: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePosition {
    holding: Decimal,
    average_open_price: Decimal,
    unrealized_pnl: Option<Decimal>,
}

#[derive(Deserialize)]
struct WirePositions {
    positions: BTreeMap<String, WirePosition>,
}

fn id_string(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(id) => Some(id),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn error_message(frame: &Value) -> String {
    str_field(frame, "errorMsg")
        .or_else(|| str_field(frame, "message"))
        .unwrap_or("unspecified error")
        .to_string()
}

impl TopicProfile {
    fn classify_event(&self, event: &str, frame: &Value) -> Frame {
        let success = frame.get("success").and_then(Value::as_bool).unwrap_or(true);
        let topic = str_field(frame, "id").or_else(|| str_field(frame, "topic"));
        match event {
            "ping" => Frame::Control(Control::Ping {
                reply: Some(PONG.to_string()),
            }),
            "pong" => Frame::Control(Control::Pong),
            "auth" => Frame::AuthAck {
                success,
                message: (!success).then(|| error_message(frame)),
            },
            "subscribe" if success => match topic.and_then(channel_of_topic) {
                Some(channel) => Frame::Control(Control::Subscribed {
                    id: topic.map(normalize_topic),
                    channel,
                }),
                None => Frame::Control(Control::Info(format!("subscribed {topic:?}"))),
            },
            "subscribe" => Frame::Control(Control::SubscribeRejected {
                channel: topic.and_then(channel_of_topic),
                id: topic.map(normalize_topic),
                reason: error_message(frame),
            }),
            "unsubscribe" => match topic {
                Some(topic) => Frame::Control(Control::Unsubscribed {
                    id: normalize_topic(topic),
                }),
                None => Frame::Unknown,
            },
            "request" if success => {
                let Some(symbol) = frame
                    .get("data")
                    .and_then(|data| str_field(data, "symbol"))
                else {
                    return Frame::Unknown;
                };
                let topic = format!("{symbol}@orderbook");
                Frame::ChannelMessage {
                    id: ChannelId::Named(topic.clone()),
                    payload: json!({
                        "topic": topic,
                        "ts": frame.get("ts").cloned().unwrap_or(Value::Null),
                        "data": frame.get("data").cloned().unwrap_or(Value::Null),
                    }),
                }
            }
            "request" | "error" => Frame::Error(error_message(frame)),
            _ => Frame::Unknown,
        }
    }

    fn decode_book(&self, channel: &Channel, topic: &str, ts: i64, data: Value) -> Result<Payload> {
        let symbol = symbol_of(channel)?;
        let wire: WireBook = serde_json::from_value(data)?;
        if topic.ends_with(BOOK_UPDATE_SUFFIX) {
            let bids = wire
                .bids
                .into_iter()
                .map(|level| LevelDelta::new(BookSide::Bid, level.0, level.1));
            let asks = wire
                .asks
                .into_iter()
                .map(|level| LevelDelta::new(BookSide::Ask, level.0, level.1));
            Ok(Payload::Delta(BookDelta {
                symbol,
                levels: bids.chain(asks).collect(),
                timestamp: Some(ts),
                sequence: None,
            }))
        } else {
            Ok(Payload::Snapshot(BookSnapshot {
                symbol,
                bids: levels(wire.bids),
                asks: levels(wire.asks),
                timestamp: ts,
                sequence: None,
            }))
        }
    }
}

impl ExchangeProfile for TopicProfile {
    fn name(&self) -> &'static str {
        "topic"
    }

    fn id_strategy(&self) -> IdStrategy {
        IdStrategy::Derived(topic_of)
    }

    fn sequence_policy(&self) -> SequencePolicy {
        SequencePolicy::Unchecked
    }

    fn canonical_channel(&self, channel: Channel) -> Channel {
        match channel.kind {
            kind if kind.is_private() => Channel::account(kind),
            ChannelType::Candles if channel.param.is_none() => channel.with_param(DEFAULT_INTERVAL),
            _ => channel,
        }
    }

    fn auth_scheme(&self) -> AuthScheme {
        AuthScheme {
            method: "",
            path: "",
            body: "",
            digest: Digest::Sha256,
            encoding: SignatureEncoding::Hex,
            secret_encoding: SecretEncoding::Raw,
        }
    }

    fn subscribe_request(&self, channel: &Channel) -> Result<String> {
        let ChannelId::Named(topic) = topic_of(channel) else {
            return Err(TickmuxError::Protocol(format!("no topic for {channel}")));
        };
        Ok(serde_json::to_string(&TopicRequest {
            id: &topic,
            event: "subscribe",
            topic: &topic,
        })?)
    }

    fn unsubscribe_request(
        &self,
        channel: &Channel,
        _id: Option<&ChannelId>,
    ) -> Result<Option<String>> {
        let ChannelId::Named(topic) = topic_of(channel) else {
            return Ok(None);
        };
        Ok(Some(serde_json::to_string(&TopicRequest {
            id: &topic,
            event: "unsubscribe",
            topic: &topic,
        })?))
    }

    fn login_request(&self, payload: &LoginPayload) -> Result<String> {
        Ok(serde_json::to_string(&json!({
            "id": "auth",
            "event": "auth",
            "params": {
                "apikey": payload.api_key,
                "sign": payload.signature,
                "timestamp": payload.nonce.to_string(),
            }
        }))?)
    }

    fn ping_request(&self) -> Option<String> {
        Some(PING.to_string())
    }

    fn resnapshot(&self, channel: &Channel) -> Resnapshot {
        let symbol = channel.symbol_or_empty();
        Resnapshot::Request(
            json!({
                "id": format!("{symbol}@orderbook"),
                "event": "request",
                "params": {"type": "orderbook", "symbol": symbol},
            })
            .to_string(),
        )
    }

    fn classify(&self, frame: Value) -> Frame {
        if let Some(event) = str_field(&frame, "event") {
            return self.classify_event(event, &frame);
        }
        match str_field(&frame, "topic") {
            Some(topic) => Frame::ChannelMessage {
                id: normalize_topic(topic),
                payload: frame,
            },
            None => Frame::Unknown,
        }
    }

    fn decode(&self, channel: &Channel, payload: Value) -> Result<Vec<Payload>> {
        let topic = str_field(&payload, "topic").unwrap_or_default().to_string();
        let ts = payload.get("ts").and_then(Value::as_i64).unwrap_or_default();
        let Value::Object(mut frame) = payload else {
            return Err(TickmuxError::Protocol("topic frame is not an object".into()));
        };
        let data = frame
            .remove("data")
            .ok_or_else(|| TickmuxError::Protocol(format!("frame on {topic} has no data")))?;

        let event = match channel.kind {
            ChannelType::OrderBook => return Ok(vec![self.decode_book(channel, &topic, ts, data)?]),
            ChannelType::Ticker => {
                let wire: WireTicker = serde_json::from_value(data)?;
                MarketEvent::Ticker(Ticker {
                    symbol: symbol_of(channel)?,
                    bid: wire.bid,
                    ask: wire.ask,
                    last: wire.close,
                    volume: wire.volume,
                    timestamp: ts,
                })
            }
            ChannelType::Trades => {
                let wire: WireTrade = serde_json::from_value(data)?;
                MarketEvent::Trades(vec![Trade {
                    id: None,
                    symbol: symbol_of(channel)?,
                    side: wire.side,
                    price: wire.price,
                    amount: wire.size,
                    timestamp: ts,
                    order_id: None,
                    fee: None,
                }])
            }
            ChannelType::Candles => {
                let wire: WireCandle = serde_json::from_value(data)?;
                MarketEvent::Candle(Candle {
                    symbol: symbol_of(channel)?,
                    interval: channel
                        .param
                        .clone()
                        .unwrap_or_else(|| DEFAULT_INTERVAL.to_string()),
                    open: wire.open,
                    high: wire.high,
                    low: wire.low,
                    close: wire.close,
                    volume: wire.volume,
                    timestamp: wire.start_time.unwrap_or(ts),
                })
            }
            ChannelType::Balance => {
                let wire: WireBalances = serde_json::from_value(data)?;
                MarketEvent::Balances(
                    wire.balances
                        .into_iter()
                        .map(|(currency, h)| Balance {
                            currency,
                            total: h.holding,
                            available: h.holding - h.frozen,
                        })
                        .collect(),
                )
            }
            ChannelType::Orders => {
                let wire: WireExecution = serde_json::from_value(data)?;
                MarketEvent::Orders(vec![Order {
                    id: id_string(Some(wire.order_id)).unwrap_or_default(),
                    symbol: wire.symbol,
                    side: wire.side,
                    price: wire.price,
                    amount: wire.quantity,
                    filled: wire.executed_quantity,
                    status: OrderStatus::from_wire(&wire.status),
                    timestamp: wire.timestamp.unwrap_or(ts),
                }])
            }
            ChannelType::MyTrades => {
                let wire: WireFill = serde_json::from_value(data)?;
                MarketEvent::MyTrades(vec![Trade {
                    id: id_string(wire.trade_id),
                    symbol: wire.symbol,
                    side: wire.side,
                    price: wire.executed_price,
                    amount: wire.executed_quantity,
                    timestamp: wire.timestamp.unwrap_or(ts),
                    order_id: id_string(wire.order_id),
                    fee: wire.fee,
                }])
            }
            ChannelType::Positions => {
                let wire: WirePositions = serde_json::from_value(data)?;
                MarketEvent::Positions(
                    wire.positions
                        .into_iter()
                        .map(|(symbol, p)| Position {
                            symbol,
                            amount: p.holding,
                            entry_price: p.average_open_price,
                            unrealized_pnl: p.unrealized_pnl,
                        })
                        .collect(),
                )
            }
        };
        Ok(vec![Payload::Event(event)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn topics_round_trip_for_public_channels() {
        let channels = [
            Channel::new(ChannelType::Ticker, "BTC/USD"),
            Channel::new(ChannelType::Trades, "BTC/USD"),
            Channel::new(ChannelType::OrderBook, "BTC/USD"),
            Channel::new(ChannelType::Candles, "BTC/USD").with_param("5m"),
            Channel::account(ChannelType::Orders),
        ];
        for channel in channels {
            let ChannelId::Named(topic) = topic_of(&channel) else {
                panic!("topic ids are always named");
            };
            assert_eq!(channel_of_topic(&topic), Some(channel));
        }
        assert_eq!(channel_of_topic("BTC/USD@level3"), None);
    }

    #[test]
    fn book_update_topic_maps_to_book_channel() {
        let frame = TopicProfile.classify(json!({
            "topic": "BTC/USD@orderbookupdate", "ts": 5, "data": {"bids": [], "asks": []}
        }));
        assert!(matches!(
            frame,
            Frame::ChannelMessage { id: ChannelId::Named(ref id), .. } if id == "BTC/USD@orderbook"
        ));
    }

    #[test]
    fn server_ping_gets_pong_reply() {
        assert_eq!(
            TopicProfile.classify(json!({"event": "ping", "ts": 1})),
            Frame::Control(Control::Ping {
                reply: Some(PONG.to_string())
            })
        );
    }

    #[test]
    fn failed_subscribe_is_a_rejection() {
        let frame = TopicProfile.classify(json!({
            "id": "NOPE@ticker", "event": "subscribe", "success": false, "errorMsg": "invalid symbol"
        }));
        assert_eq!(
            frame,
            Frame::Control(Control::SubscribeRejected {
                channel: Some(Channel::new(ChannelType::Ticker, "NOPE")),
                id: Some(ChannelId::Named("NOPE@ticker".into())),
                reason: "invalid symbol".into(),
            })
        );
    }

    #[test]
    fn decodes_delta_from_update_topic() {
        let channel = Channel::new(ChannelType::OrderBook, "BTC/USD");
        let payloads = TopicProfile
            .decode(
                &channel,
                json!({
                    "topic": "BTC/USD@orderbookupdate", "ts": 9,
                    "data": {"bids": [["100", "0"]], "asks": [[101, 3]]}
                }),
            )
            .unwrap();
        assert_eq!(
            payloads,
            vec![Payload::Delta(BookDelta {
                symbol: "BTC/USD".into(),
                levels: vec![
                    LevelDelta::new(BookSide::Bid, dec!(100), dec!(0)),
                    LevelDelta::new(BookSide::Ask, dec!(101), dec!(3)),
                ],
                timestamp: Some(9),
                sequence: None,
            })]
        );
    }

    #[test]
    fn request_response_becomes_book_snapshot_message() {
        let frame = TopicProfile.classify(json!({
            "id": "BTC/USD@orderbook", "event": "request", "success": true, "ts": 3,
            "data": {"symbol": "BTC/USD", "bids": [[1, 1]], "asks": []}
        }));
        let Frame::ChannelMessage { id, payload } = frame else {
            panic!("expected channel message");
        };
        assert_eq!(id, ChannelId::Named("BTC/USD@orderbook".into()));
        let channel = Channel::new(ChannelType::OrderBook, "BTC/USD");
        assert!(matches!(
            TopicProfile.decode(&channel, payload).unwrap().as_slice(),
            [Payload::Snapshot(_)]
        ));
    }

    #[test]
    fn balance_available_excludes_frozen() {
        let payloads = TopicProfile
            .decode(
                &Channel::account(ChannelType::Balance),
                json!({"topic": "balance", "ts": 1, "data": {"balances": {
                    "USDT": {"holding": "100", "frozen": "40"}
                }}}),
            )
            .unwrap();
        let [Payload::Event(MarketEvent::Balances(balances))] = payloads.as_slice() else {
            panic!("expected balances");
        };
        assert_eq!(balances[0].available, dec!(60));
        assert_eq!(balances[0].used(), dec!(40));
    }
}
