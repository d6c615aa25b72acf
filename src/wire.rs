use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use crate::engine::{BookingRequest, Engine, EngineError};
use crate::limits::MAX_WIRE_FRAME_LEN;
use crate::model::{Contact, Identity, Money, Ms, Role};
use crate::notify::{AvailabilityFeed, BookingFeed, BookingScope, FeedMessage};
use crate::observability;
use crate::tenant::TenantManager;
use crate::ticket;

/// One JSON object per line. Replies carry `ok`; server-initiated frames
/// carry `push`. A watch reply includes the full snapshot, and every
/// subsequent diff for that subscription arrives strictly after it.
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    /// Select the tenant store. Only valid before any other command has
    /// resolved one; defaults to "default".
    Open { store: String },
    /// Bind the acting identity for this session. The storefront backend
    /// is the trusted identity provider; it authenticates with the shared
    /// secret and relays the end user's id and role.
    Login {
        secret: String,
        user: String,
        role: Role,
    },
    Logout,
    CreateSlot {
        #[serde(default)]
        id: Option<Ulid>,
        name: String,
        starts_at: Ms,
        capacity: u32,
        price_cents: u64,
    },
    SetPrice {
        slot_id: Ulid,
        price_cents: u64,
    },
    Book {
        slot_id: Ulid,
        units: u32,
        contact: Contact,
        #[serde(default)]
        idempotency_key: Option<String>,
    },
    Cancel {
        booking_id: Ulid,
    },
    Slots,
    Availability {
        slot_id: Ulid,
    },
    GetBooking {
        booking_id: Ulid,
    },
    Ticket {
        booking_id: Ulid,
    },
    WatchAvailability {
        slot_id: Ulid,
    },
    WatchBookings,
    WatchAllBookings,
    Unwatch {
        sub: Ulid,
    },
}

enum SubKind {
    Availability,
    Bookings,
}

struct SubHandle {
    kind: SubKind,
    task: JoinHandle<()>,
}

struct Session {
    tm: Arc<TenantManager>,
    secret: String,
    store: String,
    engine: Option<Arc<Engine>>,
    identity: Option<Identity>,
    subs: HashMap<Ulid, SubHandle>,
    out: mpsc::Sender<String>,
}

pub async fn process_connection(
    socket: TcpStream,
    tm: Arc<TenantManager>,
    secret: String,
) -> std::io::Result<()> {
    let framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_WIRE_FRAME_LEN));
    let (mut sink, mut stream) = framed.split::<String>();

    // All frames — replies and pushes — funnel through one ordered queue,
    // so a watch reply (with its snapshot) always precedes its diffs.
    let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
    let writer = tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            if sink.send(line).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session {
        tm,
        secret,
        store: "default".to_string(),
        engine: None,
        identity: None,
        subs: HashMap::new(),
        out: out_tx,
    };

    while let Some(frame) = stream.next().await {
        let line = match frame {
            Ok(l) => l,
            Err(e) => {
                tracing::debug!("frame error: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Request>(&line) {
            Ok(req) => {
                let label = observability::command_label(&req);
                let start = Instant::now();
                let ok = session.handle(req).await;
                metrics::counter!(
                    observability::COMMANDS_TOTAL,
                    "command" => label,
                    "status" => if ok { "ok" } else { "error" }
                )
                .increment(1);
                metrics::histogram!(observability::COMMAND_DURATION_SECONDS, "command" => label)
                    .record(start.elapsed().as_secs_f64());
            }
            Err(e) => {
                session
                    .send(json!({
                        "ok": false,
                        "error": {"code": "bad_frame", "message": e.to_string()},
                    }))
                    .await;
            }
        }
    }

    // Connection gone: tear down forwarders; the writer exits once every
    // sender clone has been dropped.
    for (_, handle) in session.subs.drain() {
        handle.task.abort();
    }
    drop(session);
    let _ = writer.await;
    Ok(())
}

impl Session {
    /// Dispatch one request and send its reply. Returns the ok/error status
    /// for metrics.
    async fn handle(&mut self, req: Request) -> bool {
        match self.dispatch(req).await {
            Ok(Some(frame)) => {
                self.send(frame).await;
                true
            }
            Ok(None) => true, // command sent its own frames
            Err(e) => {
                self.send(error_frame(&e)).await;
                false
            }
        }
    }

    async fn dispatch(&mut self, req: Request) -> Result<Option<Value>, EngineError> {
        match req {
            Request::Open { store } => {
                if self.engine.is_some() {
                    return Err(EngineError::Validation("store already selected"));
                }
                self.store = store;
                self.engine()?;
                Ok(Some(json!({"ok": true, "store": self.store})))
            }
            Request::Login { secret, user, role } => {
                if secret != self.secret {
                    metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
                    return Err(EngineError::Unauthenticated);
                }
                if user.trim().is_empty() {
                    return Err(EngineError::Validation("user id required"));
                }
                // Identity changed: booking partitions no longer apply.
                self.end_booking_subs("identity_changed").await;
                self.identity = Some(Identity {
                    id: user.clone(),
                    role,
                });
                Ok(Some(json!({"ok": true, "user": user, "role": role})))
            }
            Request::Logout => {
                self.end_booking_subs("identity_changed").await;
                self.identity = None;
                Ok(Some(json!({"ok": true})))
            }
            Request::CreateSlot {
                id,
                name,
                starts_at,
                capacity,
                price_cents,
            } => {
                let engine = self.engine()?;
                let info = engine
                    .create_slot(
                        self.identity.as_ref(),
                        id.unwrap_or_else(Ulid::new),
                        name,
                        starts_at,
                        capacity,
                        Money::from_cents(price_cents),
                    )
                    .await?;
                Ok(Some(json!({"ok": true, "slot": info})))
            }
            Request::SetPrice {
                slot_id,
                price_cents,
            } => {
                let engine = self.engine()?;
                let info = engine
                    .set_slot_price(self.identity.as_ref(), slot_id, Money::from_cents(price_cents))
                    .await?;
                Ok(Some(json!({"ok": true, "slot": info})))
            }
            Request::Book {
                slot_id,
                units,
                contact,
                idempotency_key,
            } => {
                let engine = self.engine()?;
                let booking = engine
                    .create_booking(
                        self.identity.as_ref(),
                        BookingRequest {
                            slot_id,
                            units,
                            contact,
                            idempotency_key,
                        },
                    )
                    .await?;
                Ok(Some(json!({"ok": true, "booking": booking})))
            }
            Request::Cancel { booking_id } => {
                let engine = self.engine()?;
                engine
                    .cancel_booking(self.identity.as_ref(), booking_id)
                    .await?;
                Ok(Some(json!({"ok": true, "cancelled": booking_id})))
            }
            Request::Slots => {
                let engine = self.engine()?;
                Ok(Some(json!({"ok": true, "slots": engine.list_slots().await})))
            }
            Request::Availability { slot_id } => {
                let engine = self.engine()?;
                Ok(Some(json!({"ok": true, "slot": engine.availability(slot_id).await?})))
            }
            Request::GetBooking { booking_id } => {
                let engine = self.engine()?;
                let booking = engine
                    .get_booking(self.identity.as_ref(), booking_id)
                    .await?;
                Ok(Some(json!({"ok": true, "booking": booking})))
            }
            Request::Ticket { booking_id } => {
                let engine = self.engine()?;
                let booking = engine
                    .get_booking(self.identity.as_ref(), booking_id)
                    .await?;
                Ok(Some(json!({
                    "ok": true,
                    "booking_id": booking.id,
                    "code": ticket::issue(booking.id),
                })))
            }
            Request::WatchAvailability { slot_id } => {
                let engine = self.engine()?;
                let (snapshot, feed) = engine.watch_availability(slot_id).await?;
                let sub = Ulid::new();
                self.send(json!({"ok": true, "sub": sub, "snapshot": {"slot": snapshot}}))
                    .await;
                let task = tokio::spawn(forward_availability(
                    engine,
                    slot_id,
                    sub,
                    feed,
                    self.out.clone(),
                ));
                self.subs.insert(
                    sub,
                    SubHandle {
                        kind: SubKind::Availability,
                        task,
                    },
                );
                Ok(None)
            }
            Request::WatchBookings => {
                let engine = self.engine()?;
                let (snapshot, feed) = engine.watch_bookings(self.identity.as_ref()).await?;
                Ok(self.start_booking_watch(engine, snapshot, feed).await)
            }
            Request::WatchAllBookings => {
                let engine = self.engine()?;
                let (snapshot, feed) = engine.watch_all_bookings(self.identity.as_ref()).await?;
                Ok(self.start_booking_watch(engine, snapshot, feed).await)
            }
            Request::Unwatch { sub } => {
                // Idempotent: unknown or already-removed subscriptions are fine.
                if let Some(handle) = self.subs.remove(&sub) {
                    handle.task.abort();
                }
                Ok(Some(json!({"ok": true, "sub": sub})))
            }
        }
    }

    async fn start_booking_watch(
        &mut self,
        engine: Arc<Engine>,
        snapshot: Vec<crate::model::Booking>,
        feed: BookingFeed,
    ) -> Option<Value> {
        let sub = Ulid::new();
        self.send(json!({"ok": true, "sub": sub, "snapshot": {"bookings": snapshot}}))
            .await;
        let scope = feed.scope().clone();
        let task = tokio::spawn(forward_bookings(engine, scope, sub, feed, self.out.clone()));
        self.subs.insert(
            sub,
            SubHandle {
                kind: SubKind::Bookings,
                task,
            },
        );
        None
    }

    /// Lazily resolve this session's engine. `open` may pick a store only
    /// while no engine has been resolved yet.
    fn engine(&mut self) -> Result<Arc<Engine>, EngineError> {
        if let Some(engine) = &self.engine {
            return Ok(engine.clone());
        }
        let engine = self
            .tm
            .get_or_create(&self.store)
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        self.engine = Some(engine.clone());
        Ok(engine)
    }

    async fn end_booking_subs(&mut self, reason: &str) {
        let ended: Vec<Ulid> = self
            .subs
            .iter()
            .filter(|(_, h)| matches!(h.kind, SubKind::Bookings))
            .map(|(id, _)| *id)
            .collect();
        for sub in ended {
            if let Some(handle) = self.subs.remove(&sub) {
                handle.task.abort();
            }
            self.send(json!({"push": "watch_ended", "sub": sub, "reason": reason}))
                .await;
        }
    }

    async fn send(&self, frame: Value) {
        // A failed send means the client is gone; the read loop ends next.
        let _ = self.out.send(frame.to_string()).await;
    }
}

async fn forward_availability(
    engine: Arc<Engine>,
    slot_id: Ulid,
    sub: Ulid,
    mut feed: AvailabilityFeed,
    out: mpsc::Sender<String>,
) {
    loop {
        match feed.next().await {
            Some(FeedMessage::Notice(notice)) => {
                let frame = json!({"push": "notice", "sub": sub, "notice": notice});
                if out.send(frame.to_string()).await.is_err() {
                    break;
                }
            }
            Some(FeedMessage::Lagged) => {
                // Fell behind: resync from a fresh snapshot.
                tracing::debug!(%sub, "availability feed lagged, resyncing");
                match engine.availability(slot_id).await {
                    Ok(info) => {
                        let frame =
                            json!({"push": "snapshot", "sub": sub, "snapshot": {"slot": info}});
                        if out.send(frame.to_string()).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            None => {
                let frame = json!({"push": "watch_ended", "sub": sub, "reason": "closed"});
                let _ = out.send(frame.to_string()).await;
                break;
            }
        }
    }
}

async fn forward_bookings(
    engine: Arc<Engine>,
    scope: BookingScope,
    sub: Ulid,
    mut feed: BookingFeed,
    out: mpsc::Sender<String>,
) {
    loop {
        match feed.next().await {
            Some(FeedMessage::Notice(notice)) => {
                let frame = json!({"push": "notice", "sub": sub, "notice": notice});
                if out.send(frame.to_string()).await.is_err() {
                    break;
                }
            }
            Some(FeedMessage::Lagged) => {
                tracing::debug!(%sub, "booking feed lagged, resyncing");
                let snapshot = match &scope {
                    BookingScope::Owner(owner) => engine.bookings_for(owner).await,
                    BookingScope::All => engine.all_bookings().await,
                };
                let frame =
                    json!({"push": "snapshot", "sub": sub, "snapshot": {"bookings": snapshot}});
                if out.send(frame.to_string()).await.is_err() {
                    break;
                }
            }
            None => {
                let frame = json!({"push": "watch_ended", "sub": sub, "reason": "closed"});
                let _ = out.send(frame.to_string()).await;
                break;
            }
        }
    }
}

fn error_frame(e: &EngineError) -> Value {
    let (code, message) = match e {
        EngineError::SlotNotFound(_) => ("slot_not_found", e.to_string()),
        EngineError::BookingNotFound(_) => ("booking_not_found", e.to_string()),
        EngineError::AlreadyExists(_) => ("already_exists", e.to_string()),
        EngineError::CapacityExceeded { .. } => ("capacity_exceeded", e.to_string()),
        EngineError::Unauthenticated => ("unauthenticated", "sign in to continue".to_string()),
        EngineError::Forbidden => ("forbidden", e.to_string()),
        EngineError::Validation(_) => ("invalid_request", e.to_string()),
        EngineError::LimitExceeded(_) => ("limit_exceeded", e.to_string()),
        EngineError::WalError(detail) => {
            tracing::error!("storage failure: {detail}");
            (
                "transient_store_failure",
                "temporarily unavailable, try again".to_string(),
            )
        }
    };
    json!({"ok": false, "error": {"code": code, "message": message}})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_book_request() {
        let line = r#"{"cmd":"book","slot_id":"01ARZ3NDEKTSV4RRFFQ69G5FAV","units":2,"contact":{"name":"Ada","email":"ada@example.com"}}"#;
        let req: Request = serde_json::from_str(line).unwrap();
        match req {
            Request::Book {
                units,
                idempotency_key,
                ..
            } => {
                assert_eq!(units, 2);
                assert_eq!(idempotency_key, None);
            }
            other => panic!("expected Book, got {other:?}"),
        }
    }

    #[test]
    fn parse_login_roles() {
        let user: Request = serde_json::from_str(
            r#"{"cmd":"login","secret":"s","user":"alice","role":"user"}"#,
        )
        .unwrap();
        assert!(matches!(
            user,
            Request::Login {
                role: Role::User,
                ..
            }
        ));
        let admin: Request = serde_json::from_str(
            r#"{"cmd":"login","secret":"s","user":"ops","role":"admin"}"#,
        )
        .unwrap();
        assert!(matches!(
            admin,
            Request::Login {
                role: Role::Admin,
                ..
            }
        ));
    }

    #[test]
    fn parse_unit_commands() {
        assert!(matches!(
            serde_json::from_str::<Request>(r#"{"cmd":"slots"}"#).unwrap(),
            Request::Slots
        ));
        assert!(matches!(
            serde_json::from_str::<Request>(r#"{"cmd":"watch_bookings"}"#).unwrap(),
            Request::WatchBookings
        ));
        assert!(matches!(
            serde_json::from_str::<Request>(r#"{"cmd":"logout"}"#).unwrap(),
            Request::Logout
        ));
    }

    #[test]
    fn unknown_command_fails_to_parse() {
        assert!(serde_json::from_str::<Request>(r#"{"cmd":"drop_tables"}"#).is_err());
    }

    #[test]
    fn capacity_error_frame_shape() {
        let frame = error_frame(&EngineError::CapacityExceeded {
            requested: 3,
            available: 1,
        });
        assert_eq!(frame["ok"], false);
        assert_eq!(frame["error"]["code"], "capacity_exceeded");
    }

    #[test]
    fn wal_error_is_masked_as_transient() {
        let frame = error_frame(&EngineError::WalError("disk on fire".into()));
        assert_eq!(frame["error"]["code"], "transient_store_failure");
        let msg = frame["error"]["message"].as_str().unwrap();
        assert!(!msg.contains("disk"));
    }
}
