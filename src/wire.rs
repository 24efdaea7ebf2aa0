use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
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

use crate::auth::WashslotAuthSource;
use crate::config::Roles;
use crate::engine::{BookingError, BookingRequest, BookingService};
use crate::model::*;
use crate::observability;
use crate::sql::{self, BookingFilter, Command};
use crate::store::LocalStore;

pub type Service = BookingService<LocalStore>;

pub struct WashslotHandler {
    service: Arc<Service>,
    roles: Arc<Roles>,
    query_parser: Arc<WashslotQueryParser>,
}

/// Who is issuing a command: the login user name and what the server
/// configuration grants it.
struct Actor {
    user_id: String,
    is_admin: bool,
    group: Option<String>,
}

impl WashslotHandler {
    pub fn new(service: Arc<Service>, roles: Arc<Roles>) -> Self {
        Self {
            service,
            roles,
            query_parser: Arc::new(WashslotQueryParser),
        }
    }

    fn actor<C: ClientInfo>(&self, client: &C) -> PgWireResult<Actor> {
        let user_id = client
            .metadata()
            .get("user")
            .cloned()
            .ok_or_else(|| user_error("28000", "no user on connection".into()))?;
        Ok(Actor {
            is_admin: self.roles.is_admin(&user_id),
            group: self.roles.group_of(&user_id).map(String::from),
            user_id,
        })
    }

    /// Parse, run and record one statement.
    async fn run(&self, actor: &Actor, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(actor, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, actor: &Actor, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::UpsertMachine {
                id,
                name,
                capacity,
                access_group,
            } => {
                require_admin(actor)?;
                self.service
                    .save_machine(id, name, capacity, access_group)
                    .await
                    .map_err(booking_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::RetireMachine { id } => {
                require_admin(actor)?;
                let retired = self.service.retire_machine(id).await.map_err(booking_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(usize::from(retired)))])
            }
            Command::SelectMachines { id, access_group } => {
                let machines = match id {
                    Some(id) => vec![self.service.machine(id).await.map_err(booking_err)?],
                    None if actor.is_admin => self
                        .service
                        .list_machines(access_group.as_deref())
                        .await
                        .map_err(booking_err)?,
                    None => {
                        if access_group.is_some() && access_group != actor.group {
                            return Err(booking_err(BookingError::NotAuthorized));
                        }
                        let own = actor.group.as_deref();
                        let mut machines =
                            self.service.list_machines(own).await.map_err(booking_err)?;
                        machines.retain(|m| m.visible_to(own));
                        machines
                    }
                };
                Ok(vec![machine_rows(machines)?])
            }
            Command::InsertBooking {
                machine_id,
                date,
                start,
                end,
                requester_name,
                access_group,
            } => {
                // Group membership comes from the server's roles; a client
                // may only restate its own group.
                if access_group.is_some() && access_group != actor.group {
                    return Err(booking_err(BookingError::NotAuthorized));
                }
                let display_name = requester_name.unwrap_or_else(|| actor.user_id.clone());
                let mut request = BookingRequest::new(
                    machine_id,
                    Requester::new(actor.user_id.clone(), display_name),
                    date,
                    start,
                    end,
                );
                request.access_group = actor.group.clone();
                let booking = self.service.book(request).await.map_err(booking_err)?;
                Ok(vec![booking_rows(vec![booking])?])
            }
            Command::DeleteBooking { id } => {
                let removed = self
                    .service
                    .cancel_booking(id, &actor.user_id, actor.is_admin)
                    .await
                    .map_err(booking_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(usize::from(removed)))])
            }
            Command::SelectBookings { filter } => {
                let bookings = match filter {
                    BookingFilter::Slot { machine_id, date } => self
                        .service
                        .bookings_on(machine_id, date)
                        .await
                        .map_err(booking_err)?,
                    BookingFilter::Requester(user_id) => {
                        if user_id != actor.user_id && !actor.is_admin {
                            return Err(booking_err(BookingError::NotAuthorized));
                        }
                        self.service.bookings_for(&user_id).await.map_err(booking_err)?
                    }
                };
                Ok(vec![booking_rows(bookings)?])
            }
            Command::SelectAvailability { machine_id, date } => {
                let windows = self
                    .service
                    .free_windows(machine_id, date)
                    .await
                    .map_err(booking_err)?;

                let schema = Arc::new(availability_schema());
                let mid = machine_id.to_string();
                let day = date.to_string();
                let rows: Vec<PgWireResult<_>> = windows
                    .into_iter()
                    .map(|window| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&mid)?;
                        encoder.encode_field(&day)?;
                        encoder.encode_field(&hhmm(window.start))?;
                        encoder.encode_field(&hhmm(window.end))?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
        }
    }
}

fn require_admin(actor: &Actor) -> PgWireResult<()> {
    if actor.is_admin {
        Ok(())
    } else {
        Err(booking_err(BookingError::NotAuthorized))
    }
}

fn hhmm(time: chrono::NaiveTime) -> String {
    time.format("%H:%M").to_string()
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn machine_schema() -> Vec<FieldInfo> {
    ["id", "name", "capacity", "access_group", "retired"]
        .into_iter()
        .map(text_field)
        .collect()
}

fn booking_schema() -> Vec<FieldInfo> {
    ["id", "machine_id", "requester_id", "requester_name", "date", "start", "end"]
        .into_iter()
        .map(text_field)
        .collect()
}

fn availability_schema() -> Vec<FieldInfo> {
    ["machine_id", "date", "start", "end"]
        .into_iter()
        .map(text_field)
        .collect()
}

/// Row shape a statement will return, judged from its text alone so that
/// statements with unbound `$n` placeholders can be described.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    let reads = upper.starts_with("SELECT");
    if reads && upper.contains("AVAILABILITY") {
        availability_schema()
    } else if reads && upper.contains("MACHINES") {
        machine_schema()
    } else if (reads || upper.starts_with("INSERT")) && upper.contains("BOOKINGS") {
        booking_schema()
    } else {
        vec![]
    }
}

fn machine_rows(machines: Vec<Machine>) -> PgWireResult<Response> {
    let schema = Arc::new(machine_schema());
    let rows: Vec<PgWireResult<_>> = machines
        .into_iter()
        .map(|m| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&m.id.to_string())?;
            encoder.encode_field(&m.name)?;
            encoder.encode_field(&m.capacity)?;
            encoder.encode_field(&m.access_group)?;
            encoder.encode_field(&m.retired.to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn booking_rows(bookings: Vec<Booking>) -> PgWireResult<Response> {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.machine_id.to_string())?;
            encoder.encode_field(&b.requester.user_id)?;
            encoder.encode_field(&b.requester.display_name)?;
            encoder.encode_field(&b.date.to_string())?;
            encoder.encode_field(&hhmm(b.span.start))?;
            encoder.encode_field(&hhmm(b.span.end))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

#[async_trait]
impl SimpleQueryHandler for WashslotHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = self.actor(client)?;
        self.run(&actor, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct WashslotQueryParser;

#[async_trait]
impl QueryParser for WashslotQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for WashslotHandler {
    type Statement = String;
    type QueryParser = WashslotQueryParser;

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
        let actor = self.actor(client)?;
        let sql = substitute_params(portal);
        self.run(&actor, &sql)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| user_error("XX000", "statement produced no response".into()))
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
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

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// Substitute `$1`, `$2`, ... with bound parameter values (text format) in a
/// single left-to-right pass. Substituted text is never scanned again.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let bound = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match bound {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            Some(None) => result.push_str("NULL"),
            None => result.push_str(&rest[pos..=pos + digits]),
        }
        rest = &after[digits..];
    }
    result.push_str(rest);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct WashslotFactory {
    handler: Arc<WashslotHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<WashslotAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl WashslotFactory {
    pub fn new(service: Arc<Service>, password: String, roles: Arc<Roles>) -> Self {
        let auth_source = WashslotAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(WashslotHandler::new(service, roles)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for WashslotFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    service: Arc<Service>,
    password: String,
    roles: Arc<Roles>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(WashslotFactory::new(service, password, roles));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for a booking outcome.
pub fn sqlstate(e: &BookingError) -> &'static str {
    match e {
        BookingError::Overlap { .. } => "23P01",
        BookingError::UnknownMachine(_) => "23503",
        BookingError::InvalidInterval => "22023",
        BookingError::NotAuthorized => "42501",
        BookingError::LimitExceeded(_) => "54000",
        BookingError::StoreUnavailable(_) => "58000",
    }
}

fn booking_err(e: BookingError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_placeholders() {
        assert_eq!(count_params("SELECT * FROM machines"), 0);
        assert_eq!(count_params("SELECT * FROM bookings WHERE machine_id = $1 AND \"date\" = $2"), 2);
        assert_eq!(count_params("VALUES ($2, $10, $1)"), 10);
        assert_eq!(count_params("costs $ nothing"), 0);
    }

    #[test]
    fn bind_escapes_and_orders() {
        let params = [Some(b"O'Brien".to_vec()), None, Some(b"x".to_vec())];
        let sql = bind_params("VALUES ($1, $2, $3)", &params);
        assert_eq!(sql, "VALUES ('O''Brien', NULL, 'x')");

        let mut many: Vec<Option<Vec<u8>>> = vec![None; 10];
        many[0] = Some(b"one".to_vec());
        many[9] = Some(b"ten".to_vec());
        assert_eq!(bind_params("$1 $10", &many), "'one' 'ten'");
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let params = [Some(b"x') OR ('1".to_vec()), Some(b"hello $1".to_vec())];
        assert_eq!(
            bind_params("SELECT * FROM bookings WHERE requester_id = $2", &params),
            "SELECT * FROM bookings WHERE requester_id = 'hello $1'"
        );
        assert_eq!(bind_params("$1,$2", &params), "'x'') OR (''1','hello $1'");
        // Unbound or malformed placeholders are left as written.
        assert_eq!(bind_params("$3 $0 $ $x", &params), "$3 $0 $ $x");
    }

    #[test]
    fn schemas_follow_statement_shape() {
        let names = |fields: Vec<FieldInfo>| fields.iter().map(|f| f.name().to_string()).collect::<Vec<_>>();
        assert_eq!(names(result_schema("SELECT * FROM machines")).len(), 5);
        assert_eq!(
            names(result_schema("select * from availability where machine_id = $1")),
            vec!["machine_id", "date", "start", "end"]
        );
        assert_eq!(
            names(result_schema("INSERT INTO bookings (machine_id) VALUES ($1)"))[0],
            "id"
        );
        assert!(result_schema("DELETE FROM bookings WHERE id = $1").is_empty());
        assert!(result_schema("INSERT INTO machines (id, name) VALUES ($1, $2)").is_empty());
    }

    #[test]
    fn sqlstates() {
        assert_eq!(sqlstate(&BookingError::InvalidInterval), "22023");
        assert_eq!(sqlstate(&BookingError::NotAuthorized), "42501");
        assert_eq!(sqlstate(&BookingError::StoreUnavailable("down".into())), "58000");
    }
}
