//! Profile for exchanges that assign numeric channel ids.
//!
//! Subscribing is a handshake: the client names the channel, the exchange
//! answers with a `subscribed` event carrying the id, and every data frame
//! afterwards is addressed by that id alone.
//!
//! ```text
//! -> {"action":"subscribe","channelType":"book","symbol":"BTC/USD"}
//! <- {"event":"subscribed","channelType":"book","symbol":"BTC/USD","channelId":17}
//! <- {"channelId":17,"payload":{"type":"snapshot","bids":[["100","1"]],"asks":[],"ts":1,"seq":1}}
//! <- {"channelId":17,"payload":"hb"}
//! ```

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

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

const PONG: &str = r#"{"action":"pong"}"#;
const PING: &str = r#"{"action":"ping"}"#;

#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelIdProfile;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeRequest<'a> {
    action: &'static str,
    channel_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    symbol: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    param: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UnsubscribeRequest {
    action: &'static str,
    channel_id: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthRequest<'a> {
    action: &'static str,
    api_key: &'a str,
    nonce: i64,
    signature: &'a str,
}

#[derive(Deserialize)]
struct WireSnapshot {
    #[serde(default)]
    bids: Vec<WireLevel>,
    #[serde(default)]
    asks: Vec<WireLevel>,
    #[serde(default)]
    ts: i64,
    seq: Option<i64>,
}

#[derive(Deserialize)]
struct WireChange(BookSide, Decimal, Decimal);

#[derive(Deserialize)]
struct WireDelta {
    changes: Vec<WireChange>,
    ts: Option<i64>,
    seq: Option<i64>,
}

#[derive(Deserialize)]
struct WireTicker {
    bid: Option<Decimal>,
    ask: Option<Decimal>,
    last: Decimal,
    #[serde(default)]
    volume: Decimal,
    #[serde(default)]
    ts: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTrade {
    id: Option<Value>,
    symbol: Option<String>,
    side: Side,
    price: Decimal,
    amount: Decimal,
    #[serde(default)]
    ts: i64,
    order_id: Option<String>,
    fee: Option<Decimal>,
}

#[derive(Deserialize)]
struct WireTrades {
    trades: Vec<WireTrade>,
}

#[derive(Deserialize)]
struct WireCandle {
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    #[serde(default)]
    volume: Decimal,
    #[serde(default)]
    ts: i64,
}

#[derive(Deserialize)]
struct WireBalance {
    currency: String,
    total: Decimal,
    available: Decimal,
}

#[derive(Deserialize)]
struct WireBalances {
    balances: Vec<WireBalance>,
}

#[derive(Deserialize)]
struct WireOrder {
    id: String,
    symbol: String,
    side: Side,
    price: Option<Decimal>,
    amount: Decimal,
    #[serde(default)]
    filled: Decimal,
    status: String,
    #[serde(default)]
    ts: i64,
}

#[derive(Deserialize)]
struct WireOrders {
    orders: Vec<WireOrder>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePosition {
    symbol: String,
    amount: Decimal,
    entry_price: Decimal,
    unrealized_pnl: Option<Decimal>,
}

#[derive(Deserialize)]
struct WirePositions {
    positions: Vec<WirePosition>,
}

/// Reads the `channelType`/`symbol`/`param` triple echoed in acks and errors.
fn channel_of(frame: &Value) -> Option<Channel> {
    let kind = ChannelType::from_wire(str_field(frame, "channelType")?)?;
    Some(Channel {
        kind,
        symbol: str_field(frame, "symbol").map(String::from),
        param: str_field(frame, "param").map(String::from),
    })
}

fn id_of(frame: &Value) -> Option<ChannelId> {
    frame
        .get("channelId")
        .and_then(Value::as_u64)
        .map(ChannelId::Numeric)
}

fn message_of(frame: &Value) -> Option<String> {
    str_field(frame, "msg")
        .or_else(|| str_field(frame, "message"))
        .map(String::from)
}

fn trade_id(id: Option<Value>) -> Option<String> {
    match id? {
        Value::String(id) => Some(id),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

impl ChannelIdProfile {
    fn classify_event(&self, event: &str, frame: &Value) -> Frame {
        match event {
            "subscribed" => match channel_of(frame) {
                Some(channel) => Frame::Control(Control::Subscribed {
                    channel,
                    id: id_of(frame),
                }),
                None => Frame::Unknown,
            },
            "unsubscribed" => match id_of(frame) {
                Some(id) => Frame::Control(Control::Unsubscribed { id }),
                None => Frame::Unknown,
            },
            "error" => {
                let reason = message_of(frame).unwrap_or_else(|| "unspecified error".into());
                match (channel_of(frame), id_of(frame)) {
                    (None, None) => Frame::Error(reason),
                    (channel, id) => Frame::Control(Control::SubscribeRejected {
                        channel,
                        id,
                        reason,
                    }),
                }
            }
            "auth" => Frame::AuthAck {
                success: str_field(frame, "status").is_some_and(|s| s.eq_ignore_ascii_case("ok")),
                message: message_of(frame),
            },
            "ping" => Frame::Control(Control::Ping {
                reply: Some(PONG.to_string()),
            }),
            "pong" => Frame::Control(Control::Pong),
            "heartbeat" => Frame::Control(Control::Heartbeat),
            "info" => Frame::Control(Control::Info(
                message_of(frame)
                    .or_else(|| frame.get("version").map(Value::to_string))
                    .unwrap_or_default(),
            )),
            _ => Frame::Unknown,
        }
    }

    fn decode_book(&self, symbol: String, payload: Value) -> Result<Payload> {
        match str_field(&payload, "type") {
            Some("snapshot") => {
                let wire: WireSnapshot = serde_json::from_value(payload)?;
                Ok(Payload::Snapshot(BookSnapshot {
                    symbol,
                    bids: levels(wire.bids),
                    asks: levels(wire.asks),
                    timestamp: wire.ts,
                    sequence: wire.seq,
                }))
            }
            Some("delta") => {
                let wire: WireDelta = serde_json::from_value(payload)?;
                Ok(Payload::Delta(BookDelta {
                    symbol,
                    levels: wire
                        .changes
                        .into_iter()
                        .map(|WireChange(side, price, amount)| LevelDelta::new(side, price, amount))
                        .collect(),
                    timestamp: wire.ts,
                    sequence: wire.seq,
                }))
            }
            other => Err(TickmuxError::Protocol(format!(
                "unknown book payload type {other:?}"
            ))),
        }
    }

    fn decode_trades(&self, channel: &Channel, payload: Value) -> Result<Vec<Trade>> {
        let wire: WireTrades = serde_json::from_value(payload)?;
        Ok(wire
            .trades
            .into_iter()
            .map(|t| Trade {
                id: trade_id(t.id),
                symbol: t
                    .symbol
                    .unwrap_or_else(|| channel.symbol_or_empty().to_string()),
                side: t.side,
                price: t.price,
                amount: t.amount,
                timestamp: t.ts,
                order_id: t.order_id,
                fee: t.fee,
            })
            .collect())
    }
}

impl ExchangeProfile for ChannelIdProfile {
    fn name(&self) -> &'static str {
        "channel-id"
    }

    fn id_strategy(&self) -> IdStrategy {
        IdStrategy::ServerAssigned
    }

    fn sequence_policy(&self) -> SequencePolicy {
        SequencePolicy::Strict
    }

    fn auth_scheme(&self) -> AuthScheme {
        AuthScheme {
            method: "GET",
            path: "/ws/auth",
            body: "",
            digest: Digest::Sha384,
            encoding: SignatureEncoding::Hex,
            secret_encoding: SecretEncoding::Raw,
        }
    }

    fn subscribe_request(&self, channel: &Channel) -> Result<String> {
        Ok(serde_json::to_string(&SubscribeRequest {
            action: "subscribe",
            channel_type: channel.kind.as_str(),
            symbol: channel.symbol.as_deref(),
            param: channel.param.as_deref(),
        })?)
    }

    fn unsubscribe_request(
        &self,
        _channel: &Channel,
        id: Option<&ChannelId>,
    ) -> Result<Option<String>> {
        let Some(ChannelId::Numeric(channel_id)) = id else {
            return Ok(None);
        };
        Ok(Some(serde_json::to_string(&UnsubscribeRequest {
            action: "unsubscribe",
            channel_id: *channel_id,
        })?))
    }

    fn login_request(&self, payload: &LoginPayload) -> Result<String> {
        Ok(serde_json::to_string(&AuthRequest {
            action: "auth",
            api_key: &payload.api_key,
            nonce: payload.nonce,
            signature: &payload.signature,
        })?)
    }

    fn ping_request(&self) -> Option<String> {
        Some(PING.to_string())
    }

    fn resnapshot(&self, _channel: &Channel) -> Resnapshot {
        Resnapshot::Resubscribe
    }

    fn classify(&self, frame: Value) -> Frame {
        if let Some(event) = str_field(&frame, "event") {
            return self.classify_event(event, &frame);
        }
        let Value::Object(mut map) = frame else {
            return Frame::Unknown;
        };
        let (Some(id), Some(payload)) = (
            map.get("channelId").and_then(Value::as_u64),
            map.remove("payload"),
        ) else {
            return Frame::Unknown;
        };
        if payload.as_str() == Some("hb") {
            return Frame::Control(Control::Heartbeat);
        }
        Frame::ChannelMessage {
            id: ChannelId::Numeric(id),
            payload,
        }
    }

    fn decode(&self, channel: &Channel, payload: Value) -> Result<Vec<Payload>> {
        let event = match channel.kind {
            ChannelType::OrderBook => return Ok(vec![self.decode_book(symbol_of(channel)?, payload)?]),
            ChannelType::Ticker => {
                let wire: WireTicker = serde_json::from_value(payload)?;
                MarketEvent::Ticker(Ticker {
                    symbol: symbol_of(channel)?,
                    bid: wire.bid,
                    ask: wire.ask,
                    last: wire.last,
                    volume: wire.volume,
                    timestamp: wire.ts,
                })
            }
            ChannelType::Trades => MarketEvent::Trades(self.decode_trades(channel, payload)?),
            ChannelType::MyTrades => MarketEvent::MyTrades(self.decode_trades(channel, payload)?),
            ChannelType::Candles => {
                let wire: WireCandle = serde_json::from_value(payload)?;
                MarketEvent::Candle(Candle {
                    symbol: symbol_of(channel)?,
                    interval: channel.param.clone().unwrap_or_default(),
                    open: wire.open,
                    high: wire.high,
                    low: wire.low,
                    close: wire.close,
                    volume: wire.volume,
                    timestamp: wire.ts,
                })
            }
            ChannelType::Balance => {
                let wire: WireBalances = serde_json::from_value(payload)?;
                MarketEvent::Balances(
                    wire.balances
                        .into_iter()
                        .map(|b| Balance {
                            currency: b.currency,
                            total: b.total,
                            available: b.available,
                        })
                        .collect(),
                )
            }
            ChannelType::Orders => {
                let wire: WireOrders = serde_json::from_value(payload)?;
                MarketEvent::Orders(
                    wire.orders
                        .into_iter()
                        .map(|o| Order {
                            id: o.id,
                            symbol: o.symbol,
                            side: o.side,
                            price: o.price,
                            amount: o.amount,
                            filled: o.filled,
                            status: OrderStatus::from_wire(&o.status),
                            timestamp: o.ts,
                        })
                        .collect(),
                )
            }
            ChannelType::Positions => {
                let wire: WirePositions = serde_json::from_value(payload)?;
                MarketEvent::Positions(
                    wire.positions
                        .into_iter()
                        .map(|p| Position {
                            symbol: p.symbol,
                            amount: p.amount,
                            entry_price: p.entry_price,
                            unrealized_pnl: p.unrealized_pnl,
                        })
                        .collect(),
                )
            }
        };
        Ok(vec![Payload::Event(event)])
    }
}

/// Builds a data frame in this profile's format, for tests and simulators.
pub fn data_frame(channel_id: u64, payload: Value) -> Value {
    let mut map = Map::new();
    map.insert("channelId".into(), Value::from(channel_id));
    map.insert("payload".into(), payload);
    Value::Object(map)
}
