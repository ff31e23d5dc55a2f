use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
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
use ulid::Ulid;

use crate::auth::TurnstileAuthSource;
use crate::engine::{AdmissionError, Locale};
use crate::model::*;
use crate::observability::{self as obs, command_label};
use crate::sql::{self, Command};
use crate::tenant::{Tenant, TenantManager};

pub struct TurnstileHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<TurnstileQueryParser>,
    locale: Locale,
}

impl TurnstileHandler {
    pub fn new(tenant_manager: Arc<TenantManager>, locale: Locale) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(TurnstileQueryParser),
            locale,
        }
    }

    /// The connection's database name selects the organization.
    fn resolve_tenant<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Tenant>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_err("08006", format!("tenant error: {e}")))
    }

    async fn run(&self, tenant: &Tenant, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(tenant, cmd).await;
        metrics::histogram!(obs::QUERY_DURATION_SECONDS, "command" => label).record(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(obs::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, tenant: &Tenant, cmd: Command) -> PgWireResult<Vec<Response>> {
        let org = tenant.organization_id.as_str();
        let engine = &tenant.engine;
        let err = |e: AdmissionError| admission_err(e, self.locale);

        match cmd {
            Command::InsertClass(new_class) => {
                engine
                    .schedule_class(new_class.into_session(org))
                    .await
                    .map_err(err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::CancelClass { id } => {
                engine.cancel_class(org, id).await.map_err(err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectClass { id } => {
                let classes: Vec<ClassSession> = engine.get_class(org, id).into_iter().collect();
                Ok(vec![class_rows(&classes)])
            }
            Command::InsertBooking {
                class_id,
                member_id,
                acting_member_id,
            } => {
                let booking = engine
                    .reserve(org, class_id, member_id, actor(acting_member_id))
                    .await
                    .map_err(err)?;
                Ok(vec![booking_rows(&[booking])])
            }
            Command::CancelBooking {
                id,
                acting_member_id,
                reason,
            } => {
                let outcome = engine
                    .cancel(org, id, actor(acting_member_id), reason.as_deref())
                    .await
                    .map_err(err)?;
                let mut rows = vec![outcome.cancelled];
                rows.extend(outcome.promoted);
                Ok(vec![booking_rows(&rows)])
            }
            Command::CheckIn { id } => {
                let booking = engine.check_in(org, id).await.map_err(err)?;
                Ok(vec![booking_rows(&[booking])])
            }
            Command::MarkNoShow { id } => {
                let booking = engine.mark_no_show(org, id).await.map_err(err)?;
                Ok(vec![booking_rows(&[booking])])
            }
            Command::SelectBookings { class_id } => {
                let bookings = engine.list_bookings(org, class_id).map_err(err)?;
                Ok(vec![booking_rows(&bookings)])
            }
            Command::InsertMembership {
                member_id,
                status,
                valid_from,
                valid_until,
            } => {
                tenant
                    .store
                    .set_membership(Membership {
                        member_id,
                        status,
                        valid_from,
                        valid_until,
                    })
                    .await
                    .map_err(|e| err(e.into()))?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::ConfigureLimits {
                max_classes_per_day,
                timezone,
            } => {
                parse_timezone(&timezone).map_err(|e| user_err("22023", e))?;
                tenant
                    .store
                    .configure_limits(max_classes_per_day, &timezone)
                    .await
                    .map_err(|e| err(e.into()))?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
        }
    }
}

fn actor(acting_member_id: Option<Ulid>) -> Actor {
    acting_member_id.map_or(Actor::Staff, Actor::Member)
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn class_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("start_time", Type::INT8),
        text_field("end_time", Type::INT8),
        text_field("capacity", Type::INT8),
        text_field("confirmed_count", Type::INT8),
        text_field("waitlist_enabled", Type::BOOL),
        text_field("waitlist_capacity", Type::INT8),
        text_field("is_cancelled", Type::BOOL),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("class_id", Type::VARCHAR),
        text_field("member_id", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("waitlist_position", Type::INT8),
        text_field("checked_in_at", Type::INT8),
        text_field("cancelled_at", Type::INT8),
        text_field("cancellation_reason", Type::VARCHAR),
        text_field("created_at", Type::INT8),
    ]
}

fn class_rows(classes: &[ClassSession]) -> Response {
    let schema = Arc::new(class_schema());
    let rows: Vec<PgWireResult<_>> = classes
        .iter()
        .map(|c| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&c.id.to_string())?;
            encoder.encode_field(&c.name)?;
            encoder.encode_field(&c.start_time)?;
            encoder.encode_field(&c.end_time)?;
            encoder.encode_field(&(c.capacity as i64))?;
            encoder.encode_field(&(c.confirmed_count as i64))?;
            encoder.encode_field(&c.waitlist_enabled)?;
            encoder.encode_field(&(c.waitlist_capacity as i64))?;
            encoder.encode_field(&c.is_cancelled)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn booking_rows(bookings: &[Booking]) -> Response {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.class_id.to_string())?;
            encoder.encode_field(&b.member_id.to_string())?;
            encoder.encode_field(&b.status.as_str())?;
            encoder.encode_field(&b.waitlist_position.map(i64::from))?;
            encoder.encode_field(&b.checked_in_at)?;
            encoder.encode_field(&b.cancelled_at)?;
            encoder.encode_field(&b.cancellation_reason)?;
            encoder.encode_field(&b.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultShape {
    Classes,
    Bookings,
    Empty,
}

/// Result shape of a statement, decided from its text so that it also works for
/// prepared statements whose parameters are not bound yet.
fn result_shape(sql: &str) -> ResultShape {
    let upper = sql.to_uppercase();
    if upper.trim_start().starts_with("SELECT") && upper.contains("CLASSES") {
        ResultShape::Classes
    } else if upper.contains("BOOKINGS") {
        ResultShape::Bookings
    } else {
        ResultShape::Empty
    }
}

fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match result_shape(sql) {
        ResultShape::Classes => class_schema(),
        ResultShape::Bookings => booking_schema(),
        ResultShape::Empty => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for TurnstileHandler {
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
        let tenant = self.resolve_tenant(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.run(&tenant, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct TurnstileQueryParser;

#[async_trait]
impl QueryParser for TurnstileQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for TurnstileHandler {
    type Statement = String;
    type QueryParser = TurnstileQueryParser;

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
        let tenant = self.resolve_tenant(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.run(&tenant, cmd).await?;
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
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
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
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute(&portal.statement.statement, &params)
}

fn substitute(sql: &str, params: &[Option<String>]) -> String {
    let mut result = sql.to_string();
    // Highest index first so $1 never clobbers the prefix of $10.
    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(text) => format!("'{}'", text.replace('\'', "''")),
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct TurnstileFactory {
    handler: Arc<TurnstileHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<TurnstileAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl TurnstileFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String, locale: Locale) -> Self {
        let auth_source = TurnstileAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(TurnstileHandler::new(tenant_manager, locale)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for TurnstileFactory {
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

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    locale: Locale,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = TurnstileFactory::new(tenant_manager, password, locale);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// Business rejections carry a stable code plus a display message; infrastructure
/// failures map to the SQLSTATE a Postgres client would retry on.
fn error_parts(e: &AdmissionError, locale: Locale) -> (&'static str, String) {
    let sqlstate = match e {
        AdmissionError::StorageConflict(_) => "40001",
        AdmissionError::StorageTimeout => "57014",
        AdmissionError::Storage(_) => "58030",
        _ => "P0001",
    };
    let message = if e.is_business() {
        format!("{}: {}", e.code(), e.localized(locale))
    } else {
        format!("{}: {e}", e.code())
    };
    (sqlstate, message)
}

fn admission_err(e: AdmissionError, locale: Locale) -> PgWireError {
    if !e.is_business() {
        tracing::warn!("storage failure surfaced to client: {e}");
    }
    let (sqlstate, message) = error_parts(&e, locale);
    user_err(sqlstate, message)
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_err("42601", e.to_string())
}

fn user_err(sqlstate: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate.into(),
        message,
    )))
}
