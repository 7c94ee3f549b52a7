use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{NaiveDate, Weekday};
use futures::Sink;
use futures::stream;
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
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::{Actor, SlotwiseAuthSource};
use crate::engine::{BulkSlots, Engine, EngineError, ReserveRequest, weekday_from_index};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct SlotwiseHandler {
    tenant_manager: Arc<TenantManager>,
    auth: Arc<SlotwiseAuthSource>,
    query_parser: Arc<SlotwiseQueryParser>,
}

impl SlotwiseHandler {
    pub fn new(tenant_manager: Arc<TenantManager>, auth: Arc<SlotwiseAuthSource>) -> Self {
        Self {
            tenant_manager,
            auth,
            query_parser: Arc::new(SlotwiseQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> PgWireResult<Actor> {
        client
            .metadata()
            .get("user")
            .map(|user| self.auth.actor(user))
            .ok_or_else(|| user_error("28000", "no user in startup message".into()))
    }

    /// Authorize, run and record one parsed statement.
    async fn run(&self, engine: &Engine, actor: &Actor, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);

        let started = Instant::now();
        let result = self.execute_command(engine, actor, cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        if let Err(e) = &result {
            debug!(command = label, "query failed: {e}");
        }
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        actor: &Actor,
        cmd: Command,
    ) -> PgWireResult<Response> {
        match cmd {
            // ── Schedule store (authority only) ──────────────────
            Command::InsertProvider { id, name } => {
                require_authority(actor)?;
                engine.create_provider(id, name).await.map_err(engine_err)?;
                Ok(execution("INSERT", 1))
            }
            Command::DeleteProvider { id } => {
                require_authority(actor)?;
                engine.delete_provider(id).await.map_err(engine_err)?;
                Ok(execution("DELETE", 1))
            }
            Command::SetProviderAvailable { id, available } => {
                require_authority(actor)?;
                if available {
                    engine.mark_available(id).await
                } else {
                    engine.set_multiple_date_slots(id, BulkSlots::Unavailable).await
                }
                .map_err(engine_err)?;
                Ok(execution("UPDATE", 1))
            }
            Command::InsertWeeklySlots { provider_id, weekday, slots } => {
                require_authority(actor)?;
                let count = slots.len();
                engine
                    .set_template_day(provider_id, weekday, slots)
                    .await
                    .map_err(engine_err)?;
                Ok(execution("INSERT", count))
            }
            Command::ClearWeeklySlots { provider_id, weekday } => {
                require_authority(actor)?;
                let had = engine
                    .get_template(provider_id)
                    .await
                    .map_err(engine_err)?
                    .day(weekday)
                    .len();
                engine
                    .set_template_day(provider_id, weekday, Vec::new())
                    .await
                    .map_err(engine_err)?;
                Ok(execution("DELETE", had))
            }
            Command::InsertDateSlots { provider_id, mut dates } => {
                require_authority(actor)?;
                let rows = dates.values().map(|s| s.len().max(1)).sum();
                if dates.len() == 1
                    && let Some((date, slots)) = dates.pop_first()
                {
                    engine
                        .set_date_slots(provider_id, date, slots)
                        .await
                        .map_err(engine_err)?;
                } else {
                    engine
                        .set_multiple_date_slots(provider_id, BulkSlots::Dates(dates))
                        .await
                        .map_err(engine_err)?;
                }
                Ok(execution("INSERT", rows))
            }
            Command::DeleteDateSlots { provider_id, date } => {
                require_authority(actor)?;
                engine
                    .clear_date_slots(provider_id, date)
                    .await
                    .map_err(engine_err)?;
                Ok(execution("DELETE", 1))
            }

            // ── Ledger ───────────────────────────────────────────
            Command::InsertBooking {
                id,
                provider_id,
                start,
                end,
                requester_id,
                mode,
                notes,
                kind,
            } => {
                let requester_id = match actor {
                    Actor::Authority(_) => requester_id,
                    Actor::Requester(me) => match requester_id {
                        Some(other) if &other != me => {
                            return Err(forbidden("cannot book on behalf of another requester"));
                        }
                        _ => Some(me.clone()),
                    },
                };
                let req = ReserveRequest {
                    id,
                    provider_id,
                    requester_id,
                    // Not Span::new: inverted spans must reach validation.
                    span: Span { start, end },
                    mode,
                    kind,
                    notes,
                };
                engine.reserve(req).await.map_err(engine_err)?;
                Ok(execution("INSERT", 1))
            }
            Command::DeleteBooking { id } => {
                if let Actor::Requester(me) = actor {
                    match engine.get_booking(id).await {
                        Ok(b) if b.requester_id.as_deref() != Some(me.as_str()) => {
                            return Err(forbidden("cannot release another requester's booking"));
                        }
                        // Gone or ours: release decides
                        _ => {}
                    }
                }
                engine.release(id).await.map_err(engine_err)?;
                Ok(execution("DELETE", 1))
            }
            Command::UpdateBookingStatus { id, action } => {
                let authority = actor
                    .authority()
                    .ok_or_else(|| forbidden("only the approving authority may change booking status"))?;
                engine
                    .transition(authority, id, action)
                    .await
                    .map_err(engine_err)?;
                Ok(execution("UPDATE", 1))
            }

            // ── Reads ────────────────────────────────────────────
            Command::SelectProviders => {
                let providers = engine.list_providers().await;
                let schema = Arc::new(providers_schema());
                encode_rows(schema, providers, |enc, p| {
                    enc.encode_field(&p.id.to_string())?;
                    enc.encode_field(&p.name)?;
                    enc.encode_field(&p.available)
                })
            }
            Command::SelectWeeklySlots { provider_id } => {
                let template = engine.get_template(provider_id).await.map_err(engine_err)?;
                let pid = provider_id.to_string();
                let rows: Vec<(Weekday, Slot)> = (0..7u8)
                    .filter_map(weekday_from_index)
                    .flat_map(|wd| template.day(wd).iter().map(move |s| (wd, *s)))
                    .collect();
                encode_rows(Arc::new(weekly_slots_schema()), rows, |enc, (wd, slot)| {
                    enc.encode_field(&pid)?;
                    enc.encode_field(&wd.to_string())?;
                    encode_slot(enc, slot)
                })
            }
            Command::SelectDateSlots { provider_id } => {
                let overrides = engine.get_overrides(provider_id).await.map_err(engine_err)?;
                let pid = provider_id.to_string();
                // A closed date is one row with NULL times.
                let rows: Vec<(NaiveDate, Option<Slot>)> = overrides
                    .into_iter()
                    .flat_map(|(date, slots)| {
                        if slots.is_empty() {
                            vec![(date, None)]
                        } else {
                            slots.into_iter().map(|s| (date, Some(s))).collect()
                        }
                    })
                    .collect();
                encode_rows(Arc::new(date_slots_schema()), rows, |enc, (date, slot)| {
                    enc.encode_field(&pid)?;
                    enc.encode_field(&date.to_string())?;
                    match slot {
                        Some(slot) => encode_slot(enc, slot),
                        None => {
                            enc.encode_field(&None::<String>)?;
                            enc.encode_field(&None::<String>)?;
                            enc.encode_field(&None::<bool>)
                        }
                    }
                })
            }
            Command::SelectAvailability {
                provider_id,
                from,
                to,
                requester_id,
            } => {
                let requester = match actor {
                    Actor::Authority(_) => requester_id,
                    Actor::Requester(me) => Some(me.clone()),
                };
                let avail = engine
                    .resolve(provider_id, from, to, requester.as_deref())
                    .await
                    .map_err(engine_err)?;
                let pid = provider_id.to_string();
                let schema = Arc::new(availability_schema());
                if let Some(cooldown) = avail.cooldown_until {
                    // Capped requester: one row carrying the cooldown, no slots.
                    return encode_rows(schema, vec![cooldown], |enc, cooldown| {
                        enc.encode_field(&pid)?;
                        enc.encode_field(&None::<String>)?;
                        enc.encode_field(&"[]".to_string())?;
                        enc.encode_field(&Some(cooldown.to_string()))
                    });
                }
                encode_rows(schema, avail.dates, |enc, day| {
                    enc.encode_field(&pid)?;
                    enc.encode_field(&Some(day.date.to_string()))?;
                    enc.encode_field(&slots_json(&day.slots)?)?;
                    enc.encode_field(&None::<String>)
                })
            }
            Command::SelectTodayAvailability { provider_id } => {
                let requester = match actor {
                    Actor::Authority(_) => None,
                    Actor::Requester(me) => Some(me.as_str()),
                };
                let avail = engine
                    .resolve_today_for(provider_id, requester)
                    .await
                    .map_err(engine_err)?;
                let pid = provider_id.to_string();
                let cooldown = avail.cooldown_until.map(|d| d.to_string());
                encode_rows(Arc::new(today_schema()), avail.dates, |enc, day| {
                    enc.encode_field(&pid)?;
                    enc.encode_field(&day.date.to_string())?;
                    enc.encode_field(&slots_json(&day.slots)?)?;
                    enc.encode_field(&cooldown)
                })
            }
            Command::SelectBookings {
                provider_id,
                active_only,
                from,
            } => {
                let mut bookings = if active_only {
                    let from = from.unwrap_or_else(|| engine.today());
                    engine.list_active(provider_id, from).await
                } else {
                    engine.list_bookings(provider_id).await
                }
                .map_err(engine_err)?;
                if !active_only && let Some(from) = from {
                    let offset = engine.settings.offset;
                    bookings.retain(|b| {
                        crate::clock::date_of(b.span.start, offset).is_some_and(|d| d >= from)
                    });
                }
                if let Actor::Requester(me) = actor {
                    bookings.retain(|b| b.requester_id.as_deref() == Some(me.as_str()));
                }
                encode_rows(Arc::new(bookings_schema()), bookings, |enc, b| {
                    enc.encode_field(&b.id.to_string())?;
                    enc.encode_field(&b.provider_id.to_string())?;
                    enc.encode_field(&b.requester_id)?;
                    enc.encode_field(&b.span.start)?;
                    enc.encode_field(&b.span.end)?;
                    enc.encode_field(&b.mode.as_str().to_string())?;
                    enc.encode_field(&b.kind.as_str().to_string())?;
                    enc.encode_field(&b.status.as_str().to_string())?;
                    enc.encode_field(&b.notes)?;
                    enc.encode_field(&b.created_at)?;
                    enc.encode_field(&b.completed_at)
                })
            }
            Command::SelectQuota { requester_id } => {
                if let Actor::Requester(me) = actor
                    && *me != requester_id
                {
                    return Err(forbidden("cannot read another requester's quota"));
                }
                let q = engine.quota(&requester_id);
                encode_rows(Arc::new(quota_schema()), vec![q], |enc, q| {
                    enc.encode_field(&q.requester_id)?;
                    enc.encode_field(&(q.active_count as i64))?;
                    enc.encode_field(&(q.limit as i64))?;
                    enc.encode_field(&q.earliest.map(|d| d.to_string()))?;
                    enc.encode_field(&q.blocked_until.map(|d| d.to_string()))
                })
            }
        }
    }
}

fn execution(tag: &str, rows: usize) -> Response {
    Response::Execution(Tag::new(tag).with_rows(rows))
}

fn encode_rows<T>(
    schema: Arc<Vec<FieldInfo>>,
    items: Vec<T>,
    mut encode: impl FnMut(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn encode_slot(enc: &mut DataRowEncoder, slot: &Slot) -> PgWireResult<()> {
    let view = SlotView::from(slot);
    enc.encode_field(&view.start)?;
    enc.encode_field(&view.end)?;
    enc.encode_field(&view.available)
}

/// `[{"start":"10:00","end":"10:30","available":true}, ...]`
fn slots_json(slots: &[Slot]) -> PgWireResult<String> {
    let views: Vec<SlotView> = slots.iter().map(SlotView::from).collect();
    serde_json::to_string(&views).map_err(|e| user_error("XX000", format!("encode slots: {e}")))
}

// ── Schemas ──────────────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn boolean(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::BOOL, FieldFormat::Text)
}

fn providers_schema() -> Vec<FieldInfo> {
    vec![text("id"), text("name"), boolean("available")]
}

fn weekly_slots_schema() -> Vec<FieldInfo> {
    vec![
        text("provider_id"),
        text("weekday"),
        text("start_time"),
        text("end_time"),
        boolean("available"),
    ]
}

fn date_slots_schema() -> Vec<FieldInfo> {
    vec![
        text("provider_id"),
        text("date"),
        text("start_time"),
        text("end_time"),
        boolean("available"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text("provider_id"),
        text("date"),
        text("slots"),
        text("cooldown_until"),
    ]
}

fn today_schema() -> Vec<FieldInfo> {
    availability_schema()
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("provider_id"),
        text("requester_id"),
        int8("start"),
        int8("end"),
        text("mode"),
        text("kind"),
        text("status"),
        text("notes"),
        int8("created_at"),
        int8("completed_at"),
    ]
}

fn quota_schema() -> Vec<FieldInfo> {
    vec![
        text("requester_id"),
        int8("active_count"),
        int8("limit"),
        text("earliest"),
        text("blocked_until"),
    ]
}

/// Result columns of a statement, judged from its FROM table. Non-SELECTs
/// return nothing.
fn schema_for_sql(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    if !lower.trim_start().starts_with("select") {
        return Vec::new();
    }
    let table = lower
        .split_once(" from ")
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|t| t.trim_matches(|c: char| c == '"' || c == ';'))
        .unwrap_or_default();
    match table {
        "providers" => providers_schema(),
        "weekly_slots" => weekly_slots_schema(),
        "date_slots" => date_slots_schema(),
        "availability" => availability_schema(),
        "today_availability" => today_schema(),
        "bookings" => bookings_schema(),
        "booking_quota" => quota_schema(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotwiseHandler {
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
        let actor = self.resolve_actor(client)?;
        let cmds = sql::parse_batch(query).map_err(sql_err)?;
        // The first failure aborts the rest of the batch.
        let mut responses = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            responses.push(self.run(&engine, &actor, cmd).await?);
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotwiseQueryParser;

#[async_trait]
impl QueryParser for SlotwiseQueryParser {
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
        Ok(schema_for_sql(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotwiseHandler {
    type Statement = String;
    type QueryParser = SlotwiseQueryParser;

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
        let actor = self.resolve_actor(client)?;
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(&engine, &actor, cmd).await
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
        Ok(DescribeStatementResponse::new(
            param_types,
            schema_for_sql(&target.statement),
        ))
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
        Ok(DescribePortalResponse::new(schema_for_sql(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text
/// format) in one pass, so text inside a bound value is never rewritten.
/// Placeholders with no bound value are left as written.
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.len() - after.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        let bound = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match bound {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => {
                out.push('$');
                out.push_str(&after[..digits]);
            }
        }
        rest = &after[digits..];
    }
    out.push_str(rest);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotwiseFactory {
    handler: Arc<SlotwiseHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotwiseAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotwiseFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, auth: Arc<SlotwiseAuthSource>) -> Self {
        Self {
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                (*auth).clone(),
                DefaultServerParameterProvider::default(),
            )),
            handler: Arc::new(SlotwiseHandler::new(tenant_manager, auth)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotwiseFactory {
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

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    auth: Arc<SlotwiseAuthSource>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(SlotwiseFactory::new(tenant_manager, auth));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn forbidden(message: &str) -> PgWireError {
    user_error("42501", message.to_string())
}

fn require_authority(actor: &Actor) -> PgWireResult<()> {
    match actor {
        Actor::Authority(_) => Ok(()),
        Actor::Requester(_) => Err(forbidden("schedule changes need an authority login")),
    }
}

/// SQLSTATE for each engine failure.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Conflict { .. } => "23P01",
        EngineError::PolicyViolation { .. } => "P0001",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::HasActiveBookings(_) => "2BP01",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
