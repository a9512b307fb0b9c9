//! Client sessions: a pair of message pipes bound to the home planet, with
//! per-request subscriptions that deliver cell state in push order.
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use planet_spec::{
    AttrSchema, CellId, Defs, Msg, MsgBatch, MsgOp, PinRequest, PlanetError, PlanetResult,
    SchemaId, Value,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::app::{CellReq, CellSub};
use crate::config::HostConfig;
use crate::context::{Context, ShutdownMode};
use crate::host::AppRegistry;
use crate::planet::Planet;
use crate::registry::TypeRegistry;

/// Outbound half of one pin request.
///
/// Pushes wait while the session's outbound pipe is full. Canceling the
/// request releases a waiting push without delivering it.
pub struct Subscription {
    req_id: u64,
    outbox: Mutex<Option<mpsc::Sender<MsgBatch>>>,
    cancel: CancellationToken,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("req_id", &self.req_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Subscription {
    /// Subscription for `req_id` writing into `outbox`, closed by `cancel`.
    pub fn new(req_id: u64, outbox: mpsc::Sender<MsgBatch>, cancel: CancellationToken) -> Self {
        Self {
            req_id,
            outbox: Mutex::new(Some(outbox)),
            cancel,
        }
    }

    /// Closes the subscription; pending and later pushes fail with `Canceled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.outbox.lock().take();
    }
}

#[async_trait]
impl CellSub for Subscription {
    fn req_id(&self) -> u64 {
        self.req_id
    }

    async fn push_batch(&self, mut batch: MsgBatch) -> PlanetResult<()> {
        batch.set_req_id(self.req_id);
        let tx = self.outbox.lock().clone().ok_or(PlanetError::Canceled)?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PlanetError::Canceled),
            permit = tx.reserve() => match permit {
                Ok(permit) => {
                    permit.send(batch);
                    Ok(())
                }
                Err(_) => Err(PlanetError::SessionClosed),
            },
        }
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
            || self
                .outbox
                .lock()
                .as_ref()
                .map_or(true, |tx| tx.is_closed())
    }
}

/// The transport's side of a session: write client messages into `inbox`,
/// read pushed batches from `outbox`.
#[derive(Debug)]
pub struct SessionEndpoint {
    /// Client to host.
    pub inbox: mpsc::Sender<Msg>,
    /// Host to client.
    pub outbox: mpsc::Receiver<MsgBatch>,
}

/// A logged-in user.
#[derive(Debug)]
pub struct User {
    name: String,
    home_planet: Arc<Planet>,
}

impl User {
    /// Login name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Planet this user's pins resolve against.
    pub fn home_planet(&self) -> &Arc<Planet> {
        &self.home_planet
    }
}

/// Progress of a pin request within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqState {
    /// Accepted, app not yet consulted.
    Unresolved,
    /// Bound to a cell.
    Resolved,
    /// Subscribed; the cell pushes state to it.
    Active,
}

struct OpenReq {
    state: ReqState,
    parent: Option<u64>,
    sub: Arc<Subscription>,
    cell_id: CellId,
    req: Option<Arc<CellReq>>,
}

/// One client connection bound to a planet.
pub struct HostSession {
    session_id: u64,
    ctx: Arc<Context>,
    planet: Arc<Planet>,
    apps: Arc<AppRegistry>,
    user: RwLock<Option<Arc<User>>>,
    outbox: Mutex<Option<mpsc::Sender<MsgBatch>>>,
    endpoint: Mutex<Option<SessionEndpoint>>,
    reqs: Mutex<HashMap<u64, OpenReq>>,
    pins: TaskTracker,
    closed: AtomicBool,
}

impl fmt::Debug for HostSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostSession")
            .field("session_id", &self.session_id)
            .field("planet_id", &self.planet.planet_id())
            .field("state", &self.ctx.state())
            .field("reqs", &self.reqs.lock().len())
            .finish()
    }
}

impl HostSession {
    /// Opens a session under `planet` and starts its message loop.
    pub(crate) fn start(
        session_id: u64,
        planet: Arc<Planet>,
        apps: Arc<AppRegistry>,
        config: &HostConfig,
    ) -> PlanetResult<Arc<Self>> {
        let ctx = planet.context().child(format!("session-{session_id}"))?;
        ctx.start()?;
        let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_capacity.max(1));
        let (outbox_tx, outbox_rx) = mpsc::channel(config.outbox_capacity.max(1));
        let session = Arc::new(Self {
            session_id,
            ctx,
            planet,
            apps,
            user: RwLock::new(None),
            outbox: Mutex::new(Some(outbox_tx)),
            endpoint: Mutex::new(Some(SessionEndpoint {
                inbox: inbox_tx,
                outbox: outbox_rx,
            })),
            reqs: Mutex::new(HashMap::new()),
            pins: TaskTracker::new(),
            closed: AtomicBool::new(false),
        });
        session.ctx.spawn(session.clone().run(inbox_rx));
        info!(session_id, planet_id = %session.planet.planet_id(), "session opened");
        Ok(session)
    }

    /// Session ID, unique within its host.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Planet this session is bound to.
    pub fn planet(&self) -> &Arc<Planet> {
        &self.planet
    }

    /// Lifecycle context.
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Hands the pipes to a transport. Only the first call gets them.
    pub fn take_endpoint(&self) -> Option<SessionEndpoint> {
        self.endpoint.lock().take()
    }

    /// The logged-in user, if any.
    pub fn logged_in(&self) -> Option<Arc<User>> {
        self.user.read().clone()
    }

    /// Binds `name` to this session. A later login replaces the user.
    pub fn login(&self, name: impl Into<String>) -> Arc<User> {
        let user = Arc::new(User {
            name: name.into(),
            home_planet: self.planet.clone(),
        });
        info!(session_id = self.session_id, user = %user.name, "logged in");
        *self.user.write() = Some(user.clone());
        user
    }

    /// True once both pipes are closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// State of an open request.
    pub fn req_state(&self, req_id: u64) -> Option<ReqState> {
        self.reqs.lock().get(&req_id).map(|r| r.state)
    }

    /// Number of open requests.
    pub fn open_reqs(&self) -> usize {
        self.reqs.lock().len()
    }

    /// Cancels every request, closes the pipes, and waits for the session to stop.
    pub async fn close(&self) {
        self.ctx.stop(ShutdownMode::Immediate).await
    }

    async fn run(self: Arc<Self>, mut inbox: mpsc::Receiver<Msg>) {
        let closing = self.ctx.closing().clone();
        let abort = self.ctx.abort().clone();
        let transport_closed = loop {
            tokio::select! {
                biased;
                _ = closing.cancelled() => break false,
                msg = inbox.recv() => match msg {
                    Some(msg) => self.dispatch(msg).await,
                    None => break true,
                },
            }
        };
        drop(inbox);

        self.pins.close();
        if !transport_closed && !abort.is_cancelled() {
            tokio::select! {
                _ = self.pins.wait() => {}
                _ = abort.cancelled() => {}
            }
        }
        self.close_pipes();

        if transport_closed {
            debug!(session_id = self.session_id, "transport closed");
            tokio::spawn(self.ctx.stop(ShutdownMode::Immediate));
        }
        info!(session_id = self.session_id, "session closed");
    }

    async fn dispatch(self: &Arc<Self>, msg: Msg) {
        let req_id = msg.req_id;
        match msg.op {
            MsgOp::Login => {
                let name = match msg.value {
                    Value::Text(name) => name,
                    _ => String::new(),
                };
                self.login(name);
                self.reply(Msg::new(MsgOp::Login).with_req(req_id)).await;
            }
            MsgOp::ResolveAndRegister => {
                let reply = match msg.value {
                    Value::Defs(mut defs) => self.resolve_and_register(&mut defs).map(|()| {
                        Msg::new(MsgOp::ResolveAndRegister)
                            .with_req(req_id)
                            .with_value(Value::Defs(defs))
                    }),
                    _ => Err(PlanetError::InvalidSchema("missing defs payload".into())),
                };
                let reply = reply.unwrap_or_else(|err| {
                    warn!(session_id = self.session_id, req_id, "register failed: {err}");
                    Msg::discarded(req_id, err.to_string())
                });
                self.reply(reply).await;
            }
            MsgOp::PinCell => {
                let Value::Pin(pin) = msg.value else {
                    self.reply(Msg::discarded(req_id, "missing pin payload")).await;
                    return;
                };
                // Opened before the next message is read, so a pipelined
                // CancelReq or duplicate always sees this request.
                match self.open_pin(req_id, pin.parent_req_id) {
                    Ok((user, sub)) => self.spawn_pin(user, sub, pin),
                    Err(err) => {
                        debug!(session_id = self.session_id, req_id, "pin refused: {err}");
                        self.reply(Msg::discarded(req_id, err.to_string())).await;
                    }
                }
            }
            MsgOp::CancelReq => {
                let reply = match self.cancel_req(req_id) {
                    Ok(()) => Msg::new(MsgOp::ReqComplete).with_req(req_id),
                    Err(err) => Msg::discarded(req_id, err.to_string()),
                };
                self.reply(reply).await;
            }
            op => {
                self.reply(Msg::discarded(req_id, format!("unsupported op {op:?}")))
                    .await
            }
        }
    }

    fn open_pin(
        &self,
        req_id: u64,
        parent: Option<u64>,
    ) -> PlanetResult<(Arc<User>, Arc<Subscription>)> {
        let user = self.logged_in().ok_or(PlanetError::NotLoggedIn)?;
        let sub = self.open_req(req_id, parent)?;
        Ok((user, sub))
    }

    fn spawn_pin(self: &Arc<Self>, user: Arc<User>, sub: Arc<Subscription>, pin: PinRequest) {
        let session = self.clone();
        self.ctx.spawn(self.pins.track_future(async move {
            let req_id = sub.req_id;
            let Err(err) = session.activate(&user, sub.clone(), pin).await else {
                return;
            };
            let nested = session.close_failed(req_id, &sub);
            if err.is_canceled() {
                debug!(session_id = session.session_id, req_id, "pin canceled");
            } else {
                warn!(session_id = session.session_id, req_id, "pin failed: {err}");
                session.reply(Msg::discarded(req_id, err.to_string())).await;
            }
            for child in nested {
                let reason = format!("parent request {req_id} failed");
                session.reply(Msg::discarded(child, reason)).await;
            }
        }));
    }

    fn open_req(&self, req_id: u64, parent: Option<u64>) -> PlanetResult<Arc<Subscription>> {
        let mut reqs = self.reqs.lock();
        if reqs.contains_key(&req_id) {
            return Err(PlanetError::DuplicateRequest(req_id));
        }
        if let Some(parent) = parent.filter(|p| !reqs.contains_key(p)) {
            return Err(PlanetError::RequestNotFound(parent));
        }
        let outbox = self
            .outbox
            .lock()
            .clone()
            .ok_or(PlanetError::SessionClosed)?;
        let sub = Arc::new(Subscription::new(
            req_id,
            outbox,
            self.ctx.abort().child_token(),
        ));
        reqs.insert(
            req_id,
            OpenReq {
                state: ReqState::Unresolved,
                parent,
                sub: sub.clone(),
                cell_id: CellId::NIL,
                req: None,
            },
        );
        Ok(sub)
    }

    async fn activate(
        &self,
        user: &User,
        sub: Arc<Subscription>,
        pin: PinRequest,
    ) -> PlanetResult<()> {
        let req_id = sub.req_id;
        let planet = user.home_planet();
        let schema = self.get_schema_by_id(pin.schema_id)?;
        let child_schemas = pin
            .child_schema_ids
            .iter()
            .map(|id| self.get_schema_by_id(*id))
            .collect::<PlanetResult<Vec<_>>>()?;
        let app = self.apps.select(&schema)?;
        let parent = pin
            .parent_req_id
            .and_then(|p| self.reqs.lock().get(&p).and_then(|r| r.req.clone()));

        let mut req = CellReq::new(sub, app.clone(), planet.planet_id(), pin.pin_uri, schema)
            .with_child_schemas(child_schemas);
        if let Some(parent) = parent {
            req = req.with_parent(parent);
        }
        let resolution = app.resolve_request(&req).await?;
        req.resolve(resolution)?;
        let req = Arc::new(req);
        let cell_id = req.pin_cell();
        self.advance(req_id, ReqState::Resolved, Some(&req))?;
        debug!(
            session_id = self.session_id,
            req_id,
            cell_id = %cell_id,
            app = app.app_uri(),
            "pin resolved"
        );

        self.advance(req_id, ReqState::Active, None)?;
        planet.cells().subscribe(req).await
    }

    /// Moves an open request forward. Fails if it was canceled meanwhile.
    fn advance(&self, req_id: u64, state: ReqState, req: Option<&Arc<CellReq>>) -> PlanetResult<()> {
        let mut reqs = self.reqs.lock();
        let open = reqs.get_mut(&req_id).ok_or(PlanetError::Canceled)?;
        open.state = state;
        if let Some(req) = req {
            open.cell_id = req.pin_cell();
            open.req = Some(req.clone());
        }
        Ok(())
    }

    /// Closes `req_id` and every request nested under it.
    fn cancel_req(&self, req_id: u64) -> PlanetResult<()> {
        let closed = {
            let mut reqs = self.reqs.lock();
            if !reqs.contains_key(&req_id) {
                return Err(PlanetError::RequestNotFound(req_id));
            }
            close_tree(&mut reqs, req_id)
        };
        for (id, open) in &closed {
            self.release(*id, open);
        }
        debug!(session_id = self.session_id, req_id, "request canceled");
        Ok(())
    }

    /// Closes a request whose activation failed, along with anything nested
    /// under it. Returns the nested request IDs.
    ///
    /// A request that was canceled and reopened under the same ID belongs to
    /// a newer subscription and is left alone.
    fn close_failed(&self, req_id: u64, sub: &Arc<Subscription>) -> Vec<u64> {
        sub.cancel();
        let closed = {
            let mut reqs = self.reqs.lock();
            match reqs.get(&req_id) {
                Some(open) if Arc::ptr_eq(&open.sub, sub) => close_tree(&mut reqs, req_id),
                _ => return Vec::new(),
            }
        };
        let mut nested = Vec::new();
        for (id, open) in &closed {
            self.release(*id, open);
            if *id != req_id {
                nested.push(*id);
            }
        }
        nested.sort_unstable();
        nested
    }

    fn release(&self, req_id: u64, open: &OpenReq) {
        open.sub.cancel();
        if !open.cell_id.is_nil() {
            self.planet.cells().unsubscribe(open.cell_id, req_id);
        }
    }

    fn close_pipes(&self) {
        let open: Vec<(u64, OpenReq)> = self.reqs.lock().drain().collect();
        for (id, open) in &open {
            self.release(*id, open);
        }
        self.outbox.lock().take();
        self.endpoint.lock().take();
        self.closed.store(true, Ordering::Release);
    }

    async fn reply(&self, msg: Msg) {
        let Some(tx) = self.outbox.lock().clone() else {
            return;
        };
        tokio::select! {
            biased;
            _ = self.ctx.abort().cancelled() => {}
            sent = tx.send(MsgBatch::from(msg)) => {
                if sent.is_err() {
                    debug!(session_id = self.session_id, "outbound pipe closed");
                }
            }
        }
    }
}

/// Removes `req_id` and every request nested under it, at any depth.
fn close_tree(reqs: &mut HashMap<u64, OpenReq>, req_id: u64) -> Vec<(u64, OpenReq)> {
    let mut doomed = HashSet::from([req_id]);
    loop {
        let nested: Vec<u64> = reqs
            .iter()
            .filter(|(id, r)| !doomed.contains(*id) && r.parent.is_some_and(|p| doomed.contains(&p)))
            .map(|(id, _)| *id)
            .collect();
        if nested.is_empty() {
            break;
        }
        doomed.extend(nested);
    }
    doomed
        .into_iter()
        .filter_map(|id| reqs.remove(&id).map(|r| (id, r)))
        .collect()
}

impl TypeRegistry for HostSession {
    fn resolve_and_register(&self, defs: &mut Defs) -> PlanetResult<()> {
        self.planet.registry().resolve_and_register(defs)
    }

    fn get_schema_by_id(&self, schema_id: SchemaId) -> PlanetResult<Arc<AttrSchema>> {
        self.planet.registry().get_schema_by_id(schema_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use planet_spec::SymbolId;
    use std::time::Duration;

    fn attr(n: u64) -> Msg {
        Msg::push_attr(CellId(1), SchemaId(1), SymbolId(n), Value::Int(n as i64))
    }

    #[tokio::test]
    async fn pushes_arrive_in_order_through_a_full_pipe() {
        let (tx, mut rx) = mpsc::channel(1);
        let sub = Arc::new(Subscription::new(4, tx, CancellationToken::new()));
        let producer = {
            let sub = sub.clone();
            tokio::spawn(async move {
                for n in 1..=3 {
                    sub.push_msg(attr(n)).await.unwrap();
                }
            })
        };
        let mut seen = Vec::new();
        for _ in 0..3 {
            let batch = rx.recv().await.unwrap();
            assert_eq!(batch.msgs[0].req_id, 4);
            seen.push(batch.msgs[0].attr_id.0);
        }
        producer.await.unwrap();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn cancel_releases_a_blocked_push_without_delivering() {
        let (tx, mut rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        let sub = Arc::new(Subscription::new(4, tx, token.clone()));
        sub.push_msg(attr(1)).await.unwrap();

        let blocked = {
            let sub = sub.clone();
            tokio::spawn(async move { sub.push_msg(attr(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());
        token.cancel();
        assert_eq!(blocked.await.unwrap(), Err(PlanetError::Canceled));
        assert!(sub.is_closed());

        assert_eq!(rx.recv().await.unwrap().msgs[0].attr_id, SymbolId(1));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn push_after_receiver_drop_reports_closed_session() {
        let (tx, rx) = mpsc::channel(1);
        let sub = Subscription::new(4, tx, CancellationToken::new());
        drop(rx);
        assert!(sub.is_closed());
        assert_eq!(
            sub.push_msg(attr(1)).await,
            Err(PlanetError::SessionClosed)
        );
    }

    fn open(parent: Option<u64>) -> OpenReq {
        let (tx, _rx) = mpsc::channel(1);
        OpenReq {
            state: ReqState::Active,
            parent,
            sub: Arc::new(Subscription::new(0, tx, CancellationToken::new())),
            cell_id: CellId::NIL,
            req: None,
        }
    }

    #[test]
    fn close_tree_takes_every_nested_level() {
        let mut reqs = HashMap::from([
            (1, open(None)),
            (2, open(Some(1))),
            (3, open(Some(2))),
            (4, open(None)),
            (5, open(Some(4))),
        ]);
        let mut closed: Vec<u64> = close_tree(&mut reqs, 1).into_iter().map(|(id, _)| id).collect();
        closed.sort_unstable();
        assert_eq!(closed, vec![1, 2, 3]);
        let mut left: Vec<u64> = reqs.keys().copied().collect();
        left.sort_unstable();
        assert_eq!(left, vec![4, 5]);
    }
}
