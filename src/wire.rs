use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use futures::{Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::auth::{Actor, QuorumAuthSource};
use crate::engine::Engine;
use crate::model::*;
use crate::notify::Notification;
use crate::observability;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

/// One handler per connection: LISTEN subscriptions are connection state.
pub struct QuorumHandler {
    tenant_manager: Arc<TenantManager>,
    admins: Arc<HashSet<String>>,
    query_parser: Arc<QuorumQueryParser>,
    /// room id → broadcast receiver, drained ahead of each query response.
    subscriptions: Mutex<HashMap<Ulid, broadcast::Receiver<Notification>>>,
}

impl QuorumHandler {
    pub fn new(tenant_manager: Arc<TenantManager>, admins: Arc<HashSet<String>>) -> Self {
        Self {
            tenant_manager,
            admins,
            query_parser: Arc::new(QuorumQueryParser),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> Actor {
        let user = client
            .metadata()
            .get("user")
            .cloned()
            .unwrap_or_else(|| "anonymous".to_string());
        Actor::resolve(user, &self.admins)
    }

    /// Pull everything buffered on this connection's subscriptions.
    /// Lagged receivers skip ahead; closed channels (deleted rooms) drop out.
    fn drain_notifications(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        let mut subs = self.subscriptions.lock().expect("subscriptions lock poisoned");
        subs.retain(|room_id, rx| loop {
            match rx.try_recv() {
                Ok(n) => {
                    let payload = serde_json::to_string(&n).unwrap_or_default();
                    out.push((format!("room_{room_id}"), payload));
                }
                Err(broadcast::error::TryRecvError::Empty) => break true,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Closed) => break false,
            }
        });
        out
    }

    async fn run_command(
        &self,
        engine: &Engine,
        actor: &Actor,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let start = std::time::Instant::now();
        let result = self.execute_command(engine, actor, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        actor: &Actor,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertRoom { id, name, capacity, location, approver, maintenance } => {
                engine
                    .create_room(id, name, capacity, location, approver, maintenance, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateRoom { id, name, capacity, location, approver, maintenance } => {
                engine
                    .update_room(id, name, capacity, location, approver, maintenance, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteRoom { id } => {
                engine.delete_room(id, actor).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertEquipment { id, name, description } => {
                engine
                    .add_equipment(id, name, description, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteEquipment { id } => {
                engine.remove_equipment(id, actor).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertBooking { req } => {
                let ids = engine.create_booking(req, actor).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(ids.len()))])
            }
            Command::SetBookingStatus { id, status } => {
                match status {
                    BookingStatus::Approved => engine.approve_booking(id, actor).await,
                    BookingStatus::Rejected => engine.reject_booking(id, actor).await,
                    BookingStatus::Cancelled => engine.cancel_booking(id, actor).await,
                    BookingStatus::Pending => Err(crate::engine::EngineError::PermissionDenied(
                        "bookings cannot be moved back to pending",
                    )),
                }
                .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::UpdateBooking { id, patch } => {
                engine.edit_booking(id, patch, actor).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteBooking { id } => {
                engine.cancel_booking(id, actor).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectRooms => {
                let rooms = engine.list_rooms();
                let schema = Arc::new(rooms_schema());
                let rows: Vec<PgWireResult<_>> = rooms
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.name)?;
                        encoder.encode_field(&(r.capacity as i64))?;
                        encoder.encode_field(&r.location)?;
                        encoder.encode_field(&r.approver)?;
                        encoder.encode_field(&r.maintenance.map(|w| w.start.to_rfc3339()))?;
                        encoder.encode_field(&r.maintenance.map(|w| w.end.to_rfc3339()))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectEquipment => {
                let items = engine.list_equipment();
                let schema = Arc::new(equipment_schema());
                let rows: Vec<PgWireResult<_>> = items
                    .into_iter()
                    .map(|e| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&e.id.to_string())?;
                        encoder.encode_field(&e.name)?;
                        encoder.encode_field(&e.description)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectBookings { room_id, window, status } => {
                let bookings = match window {
                    // A time window is the calendar feed: active bookings only.
                    Some(w) => engine
                        .bookings_in_window(room_id, w)
                        .await
                        .map_err(engine_err)?,
                    None => engine
                        .list_bookings(room_id, status)
                        .await
                        .map_err(engine_err)?,
                };
                // Status filter also applies on top of a window query.
                let bookings: Vec<BookingInfo> = bookings
                    .into_iter()
                    .filter(|b| status.is_none_or(|s| b.status == s))
                    .collect();

                let schema = Arc::new(bookings_schema());
                let rows: Vec<PgWireResult<_>> = bookings
                    .into_iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.series_id.map(|s| s.to_string()))?;
                        encoder.encode_field(&b.room_id.to_string())?;
                        encoder.encode_field(&b.owner)?;
                        encoder.encode_field(&b.start.to_rfc3339())?;
                        encoder.encode_field(&b.end.to_rfc3339())?;
                        encoder.encode_field(&b.title)?;
                        encoder.encode_field(&(b.participants as i64))?;
                        encoder.encode_field(&b.status.as_str())?;
                        encoder.encode_field(&b.notified)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::Listen { channel } => {
                let room_id = parse_room_channel(&channel)?;
                let rx = engine.notify.subscribe(room_id);
                self.subscriptions
                    .lock()
                    .expect("subscriptions lock poisoned")
                    .entry(room_id)
                    .or_insert(rx);
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                let room_id = parse_room_channel(&channel)?;
                self.subscriptions
                    .lock()
                    .expect("subscriptions lock poisoned")
                    .remove(&room_id);
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::UnlistenAll => {
                self.subscriptions
                    .lock()
                    .expect("subscriptions lock poisoned")
                    .clear();
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }
}

fn parse_room_channel(channel: &str) -> PgWireResult<Ulid> {
    let raw = channel.strip_prefix("room_").ok_or_else(|| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("invalid channel: {channel} (expected room_{{id}})"),
        )))
    })?;
    Ulid::from_string(raw).map_err(|e| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("bad ULID in channel: {e}"),
        )))
    })
}

fn rooms_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("name".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("capacity".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("location".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("approver".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("maintenance_start".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("maintenance_end".into(), None, None, Type::VARCHAR, FieldFormat::Text),
    ]
}

fn equipment_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("name".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("description".into(), None, None, Type::VARCHAR, FieldFormat::Text),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("series_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("room_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("owner".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("start".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("end".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("title".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("participants".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("status".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("notified".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

#[async_trait]
impl SimpleQueryHandler for QuorumHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let actor = self.resolve_actor(client);
        for (channel, payload) in self.drain_notifications() {
            client
                .feed(PgWireBackendMessage::NotificationResponse(
                    NotificationResponse::new(0, channel, payload),
                ))
                .await?;
        }
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.run_command(&engine, &actor, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct QuorumQueryParser;

#[async_trait]
impl QueryParser for QuorumQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(select_schema(stmt).unwrap_or_default())
    }
}

/// Result schema for a SELECT statement, by target table.
fn select_schema(stmt: &str) -> Option<Vec<FieldInfo>> {
    let upper = stmt.to_uppercase();
    if !upper.contains("SELECT") {
        return None;
    }
    if upper.contains("BOOKINGS") {
        Some(bookings_schema())
    } else if upper.contains("EQUIPMENT") {
        Some(equipment_schema())
    } else if upper.contains("ROOMS") {
        Some(rooms_schema())
    } else {
        None
    }
}

#[async_trait]
impl ExtendedQueryHandler for QuorumHandler {
    type Statement = String;
    type QueryParser = QuorumQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let actor = self.resolve_actor(client);
        for (channel, payload) in self.drain_notifications() {
            client
                .feed(PgWireBackendMessage::NotificationResponse(
                    NotificationResponse::new(0, channel, payload),
                ))
                .await?;
        }
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.run_command(&engine, &actor, cmd).await?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        let schema = select_schema(&target.statement).unwrap_or_default();
        Ok(DescribeStatementResponse::new(param_types, schema))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let schema = select_schema(&target.statement.statement).unwrap_or_default();
        Ok(DescribePortalResponse::new(schema))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    if n > max {
                        max = n;
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }

    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct QuorumFactory {
    handler: Arc<QuorumHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<QuorumAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl QuorumFactory {
    pub fn new(
        tenant_manager: Arc<TenantManager>,
        password: String,
        admins: Arc<HashSet<String>>,
    ) -> Self {
        let auth_source = QuorumAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(QuorumHandler::new(tenant_manager, admins)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for QuorumFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one connection. A fresh factory per socket keeps LISTEN
/// subscriptions scoped to the connection that made them.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    admins: Arc<HashSet<String>>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = QuorumFactory::new(tenant_manager, password, admins);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
