//! Cell address space: issues cell IDs and runs one owner task per active
//! cell. Every pin, full-state push, and incremental update for a cell goes
//! through its owner, so each cell has exactly one writer.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use planet_spec::{CellId, PlanetError, PlanetId, PlanetResult};
use tokio::sync::mpsc::error::SendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::app::{AppCell, AttrValue, CellReq};
use crate::context::Context;

const SUBSCRIBE_ATTEMPTS: usize = 3;
const REDELIVER_BACKOFF: Duration = Duration::from_millis(1);

enum CellCmd {
    Subscribe {
        req: Arc<CellReq>,
        reply: oneshot::Sender<PlanetResult<()>>,
    },
    Publish {
        cell: Option<Arc<dyn AppCell>>,
        attrs: Vec<AttrValue>,
        applied: oneshot::Sender<()>,
    },
    Unsubscribe(u64),
}

type Owners = Arc<Mutex<HashMap<CellId, mpsc::Sender<CellCmd>>>>;

/// A planet's cell address space.
#[derive(Debug)]
pub struct CellSpace {
    planet_id: PlanetId,
    ctx: Arc<Context>,
    cmd_capacity: usize,
    next_cell_id: AtomicU64,
    owners: Owners,
}

impl CellSpace {
    /// Address space whose owner tasks run under `ctx`.
    pub fn new(planet_id: PlanetId, ctx: Arc<Context>, cmd_capacity: usize) -> Self {
        Self {
            planet_id,
            ctx,
            cmd_capacity: cmd_capacity.max(1),
            next_cell_id: AtomicU64::new(1),
            owners: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Issues a fresh cell ID. IDs are never reused.
    pub fn issue_cell_id(&self) -> CellId {
        CellId(self.next_cell_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of cells with a running owner.
    pub fn active_cells(&self) -> usize {
        self.owners.lock().len()
    }

    /// Activates a resolved request: the cell owner pushes full state and
    /// keeps the request for later updates. Resolves once full state is queued.
    pub async fn subscribe(&self, req: Arc<CellReq>) -> PlanetResult<()> {
        let cell_id = req.pin_cell();
        if cell_id.is_nil() {
            return Err(PlanetError::UnknownUri(req.pin_uri.clone()));
        }
        for _ in 0..SUBSCRIBE_ATTEMPTS {
            let owner = self.owner(cell_id)?;
            let (reply, rx) = oneshot::channel();
            let cmd = CellCmd::Subscribe {
                req: req.clone(),
                reply,
            };
            if owner.send(cmd).await.is_err() {
                continue;
            }
            match rx.await {
                Ok(result) => return result,
                // The owner retired before reading the command.
                Err(_) if self.ctx.is_running() => continue,
                Err(_) => break,
            }
        }
        Err(PlanetError::Canceled)
    }

    /// Forwards an incremental update to every subscriber of `cell_id`.
    /// A cell with no subscribers has no owner and the update is dropped.
    pub async fn publish(&self, cell_id: CellId, attrs: Vec<AttrValue>) {
        self.apply(cell_id, None, attrs).await
    }

    /// Applies `attrs` to `cell` on the cell's owner, then forwards them to
    /// every subscriber. Mutation order and push order are the same.
    ///
    /// Without an owner the cell is mutated in place while owner creation
    /// is locked out. Resolves once the mutation is applied; pushes may still
    /// be in flight.
    pub async fn update(&self, cell_id: CellId, cell: Arc<dyn AppCell>, attrs: Vec<AttrValue>) {
        self.apply(cell_id, Some(cell), attrs).await
    }

    async fn apply(&self, cell_id: CellId, cell: Option<Arc<dyn AppCell>>, attrs: Vec<AttrValue>) {
        loop {
            let owner = {
                let owners = self.owners.lock();
                match owners.get(&cell_id) {
                    Some(owner) => owner.clone(),
                    None => {
                        if let Some(cell) = &cell {
                            cell.apply_update(&attrs);
                        }
                        return;
                    }
                }
            };
            let (applied, done) = oneshot::channel();
            let cmd = CellCmd::Publish {
                cell: cell.clone(),
                attrs: attrs.clone(),
                applied,
            };
            match owner.send(cmd).await {
                Ok(()) => {
                    if done.await.is_ok() {
                        return;
                    }
                    // Dropped unapplied by an owner on its way out.
                }
                Err(SendError(_)) => {
                    // Draining owner; wait for it to leave the map.
                    tokio::time::sleep(REDELIVER_BACKOFF).await;
                }
            }
        }
    }

    /// Drops a request from its cell's subscriber list.
    ///
    /// Never waits: if the owner's queue is full the canceled request is
    /// pruned on the owner's next command instead.
    pub fn unsubscribe(&self, cell_id: CellId, req_id: u64) {
        if let Some(owner) = self.owners.lock().get(&cell_id) {
            let _ = owner.try_send(CellCmd::Unsubscribe(req_id));
        }
    }

    fn owner(&self, cell_id: CellId) -> PlanetResult<mpsc::Sender<CellCmd>> {
        let mut owners = self.owners.lock();
        if let Some(tx) = owners.get(&cell_id) {
            return Ok(tx.clone());
        }
        if !self.ctx.is_running() {
            return Err(PlanetError::NotRunning(self.ctx.label().to_string()));
        }
        let (tx, rx) = mpsc::channel(self.cmd_capacity);
        owners.insert(cell_id, tx.clone());
        let owner = CellOwner {
            planet_id: self.planet_id,
            cell_id,
            ctx: self.ctx.clone(),
            owners: self.owners.clone(),
            subs: Vec::new(),
        };
        self.ctx.spawn(owner.run(rx));
        debug!(planet_id = %self.planet_id, cell_id = %cell_id, "cell owner started");
        Ok(tx)
    }
}

struct CellOwner {
    planet_id: PlanetId,
    cell_id: CellId,
    ctx: Arc<Context>,
    owners: Owners,
    subs: Vec<Arc<CellReq>>,
}

impl CellOwner {
    async fn run(mut self, mut rx: mpsc::Receiver<CellCmd>) {
        let closing = self.ctx.closing().clone();
        let abort = self.ctx.abort().clone();
        let mut draining = false;
        let mut retired = false;
        loop {
            let cmd = tokio::select! {
                biased;
                _ = abort.cancelled() => break,
                _ = closing.cancelled(), if !draining => {
                    draining = true;
                    rx.close();
                    continue;
                }
                cmd = rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };
            tokio::select! {
                biased;
                _ = abort.cancelled() => break,
                _ = self.handle(cmd) => {}
            }
            if self.subs.is_empty() && !draining && self.retire(&rx) {
                retired = true;
                break;
            }
        }
        if !retired {
            self.owners.lock().remove(&self.cell_id);
        }
        debug!(planet_id = %self.planet_id, cell_id = %self.cell_id, "cell owner stopped");
    }

    async fn handle(&mut self, cmd: CellCmd) {
        match cmd {
            CellCmd::Subscribe { req, reply } => {
                let result = match req.pinned_cell() {
                    Some(cell) => cell.push_cell_state(&req).await,
                    None => Err(PlanetError::UnknownUri(req.pin_uri.clone())),
                };
                if result.is_ok() && !req.sub.is_closed() {
                    self.subs.push(req);
                } else if let Err(err) = &result {
                    debug!(cell_id = %self.cell_id, "full state push failed: {err}");
                }
                let _ = reply.send(result);
            }
            CellCmd::Publish {
                cell,
                attrs,
                applied,
            } => {
                if let Some(cell) = &cell {
                    cell.apply_update(&attrs);
                }
                let _ = applied.send(());
                self.subs.retain(|req| !req.sub.is_closed());
                for req in &self.subs {
                    let batch = req.encode_attrs(&attrs, false);
                    if batch.is_empty() {
                        continue;
                    }
                    if let Err(err) = req.push_batch(batch).await {
                        if !err.is_canceled() {
                            warn!(cell_id = %self.cell_id, req_id = req.req_id, "update push failed: {err}");
                        }
                    }
                }
                self.subs.retain(|req| !req.sub.is_closed());
            }
            CellCmd::Unsubscribe(req_id) => {
                self.subs.retain(|req| req.req_id != req_id && !req.sub.is_closed());
            }
        }
    }

    /// Removes this owner from the address space if nothing is queued.
    fn retire(&self, rx: &mpsc::Receiver<CellCmd>) -> bool {
        let mut owners = self.owners.lock();
        if !rx.is_empty() {
            return false;
        }
        owners.remove(&self.cell_id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{App, AppCell, CellSub, Resolution};
    use crate::context::ShutdownMode;
    use async_trait::async_trait;
    use planet_spec::{AttrSchema, MsgBatch, SchemaId, SymbolId, Value, ValueType};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingSub {
        req_id: u64,
        batches: Mutex<Vec<MsgBatch>>,
    }

    #[async_trait]
    impl CellSub for RecordingSub {
        fn req_id(&self) -> u64 {
            self.req_id
        }
        async fn push_batch(&self, mut batch: MsgBatch) -> PlanetResult<()> {
            batch.set_req_id(self.req_id);
            self.batches.lock().push(batch);
            Ok(())
        }
        fn is_closed(&self) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct CountingCell {
        pushes: AtomicUsize,
        applied: Mutex<Vec<AttrValue>>,
    }

    #[async_trait]
    impl AppCell for CountingCell {
        async fn push_cell_state(&self, req: &CellReq) -> PlanetResult<()> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            let attrs = [AttrValue::new("title", Value::Text("t".into()))];
            req.push_batch(req.encode_attrs(&attrs, true)).await
        }

        fn apply_update(&self, attrs: &[AttrValue]) {
            self.applied.lock().extend_from_slice(attrs);
        }
    }

    struct NoApp;

    #[async_trait]
    impl App for NoApp {
        fn app_uri(&self) -> &str {
            "test/none/v0.0.1"
        }
        fn data_model_uris(&self) -> Vec<String> {
            Vec::new()
        }
        async fn resolve_request(&self, req: &CellReq) -> PlanetResult<Resolution> {
            Err(PlanetError::UnknownUri(req.pin_uri.clone()))
        }
    }

    fn schema() -> Arc<AttrSchema> {
        let mut s = AttrSchema::new("planet/doc").with_attr("title", ValueType::Text);
        s.schema_id = SchemaId(1);
        s.attrs[0].attr_id = SymbolId(2);
        Arc::new(s)
    }

    fn resolved(sub: Arc<RecordingSub>, cell: Arc<CountingCell>, cell_id: CellId) -> Arc<CellReq> {
        let mut req = CellReq::new(sub, Arc::new(NoApp), PlanetId(1), "/doc/1", schema());
        req.resolve(Resolution {
            pin_cell: cell_id,
            pin_cell_schema: schema(),
            child_schemas: Vec::new(),
            pinned_cell: cell,
        })
        .unwrap();
        Arc::new(req)
    }

    #[tokio::test]
    async fn subscribers_get_full_state_then_updates() {
        let ctx = Context::root("planet");
        ctx.start().unwrap();
        let space = CellSpace::new(PlanetId(1), ctx.clone(), 8);
        let cell_id = space.issue_cell_id();
        let cell = Arc::new(CountingCell::default());
        let a = Arc::new(RecordingSub {
            req_id: 1,
            ..Default::default()
        });
        let b = Arc::new(RecordingSub {
            req_id: 2,
            ..Default::default()
        });
        space
            .subscribe(resolved(a.clone(), cell.clone(), cell_id))
            .await
            .unwrap();
        space
            .subscribe(resolved(b.clone(), cell.clone(), cell_id))
            .await
            .unwrap();
        assert_eq!(space.active_cells(), 1);
        assert_eq!(cell.pushes.load(Ordering::SeqCst), 2);

        space
            .publish(cell_id, vec![AttrValue::new("title", Value::Text("u".into()))])
            .await;
        ctx.stop(ShutdownMode::Graceful {
            timeout: std::time::Duration::from_secs(5),
        })
        .await;

        for sub in [&a, &b] {
            let batches = sub.batches.lock();
            assert_eq!(batches.len(), 2);
            assert_eq!(batches[1].msgs[0].value, Value::Text("u".into()));
            assert!(batches
                .iter()
                .flat_map(|batch| &batch.msgs)
                .all(|m| m.req_id == sub.req_id));
        }
        assert_eq!(space.active_cells(), 0);
    }

    #[tokio::test]
    async fn owner_retires_when_last_subscriber_leaves() {
        let ctx = Context::root("planet");
        ctx.start().unwrap();
        let space = CellSpace::new(PlanetId(1), ctx.clone(), 8);
        let cell_id = space.issue_cell_id();
        let cell = Arc::new(CountingCell::default());
        let sub = Arc::new(RecordingSub {
            req_id: 7,
            ..Default::default()
        });
        space.subscribe(resolved(sub, cell, cell_id)).await.unwrap();
        space.unsubscribe(cell_id, 7);
        for _ in 0..100 {
            if space.active_cells() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(space.active_cells(), 0);
        ctx.stop(ShutdownMode::Immediate).await;
    }

    #[tokio::test]
    async fn stopped_space_refuses_subscriptions() {
        let ctx = Context::root("planet");
        ctx.start().unwrap();
        let space = CellSpace::new(PlanetId(1), ctx.clone(), 8);
        ctx.stop(ShutdownMode::Immediate).await;
        let cell = Arc::new(CountingCell::default());
        let sub = Arc::new(RecordingSub::default());
        let err = space
            .subscribe(resolved(sub, cell, CellId(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, PlanetError::NotRunning(_)));
    }

    #[tokio::test]
    async fn update_without_owner_applies_in_place() {
        let ctx = Context::root("planet");
        ctx.start().unwrap();
        let space = CellSpace::new(PlanetId(1), ctx.clone(), 8);
        let cell = Arc::new(CountingCell::default());
        let attrs = vec![AttrValue::new("title", Value::Text("x".into()))];
        space.update(space.issue_cell_id(), cell.clone(), attrs.clone()).await;
        assert_eq!(*cell.applied.lock(), attrs);
        assert_eq!(space.active_cells(), 0);

        // Nothing to mutate and nobody to tell.
        space.publish(CellId(99), attrs).await;
        ctx.stop(ShutdownMode::Immediate).await;
    }

    #[tokio::test]
    async fn owner_applies_updates_before_pushing_them() {
        let ctx = Context::root("planet");
        ctx.start().unwrap();
        let space = CellSpace::new(PlanetId(1), ctx.clone(), 8);
        let cell_id = space.issue_cell_id();
        let cell = Arc::new(CountingCell::default());
        let sub = Arc::new(RecordingSub {
            req_id: 3,
            ..Default::default()
        });
        space
            .subscribe(resolved(sub.clone(), cell.clone(), cell_id))
            .await
            .unwrap();

        for title in ["a", "b", "c"] {
            let attrs = vec![AttrValue::new("title", Value::Text(title.into()))];
            space.update(cell_id, cell.clone(), attrs).await;
        }
        ctx.stop(ShutdownMode::Graceful {
            timeout: std::time::Duration::from_secs(5),
        })
        .await;

        let applied: Vec<Value> = cell.applied.lock().iter().map(|a| a.value.clone()).collect();
        let pushed: Vec<Value> = sub.batches.lock()[1..]
            .iter()
            .map(|batch| batch.msgs[0].value.clone())
            .collect();
        assert_eq!(applied, pushed);
        assert_eq!(pushed.len(), 3);
    }

    #[tokio::test]
    async fn update_racing_a_retiring_owner_applies_once() {
        let ctx = Context::root("planet");
        ctx.start().unwrap();
        let space = CellSpace::new(PlanetId(1), ctx.clone(), 8);
        let cell_id = space.issue_cell_id();
        let cell = Arc::new(CountingCell::default());
        for round in 0..20u64 {
            let sub = Arc::new(RecordingSub {
                req_id: round,
                ..Default::default()
            });
            space
                .subscribe(resolved(sub, cell.clone(), cell_id))
                .await
                .unwrap();
            space.unsubscribe(cell_id, round);
            let attrs = vec![AttrValue::new("title", Value::Int(round as i64))];
            space.update(cell_id, cell.clone(), attrs).await;
        }
        let applied: Vec<Value> = cell.applied.lock().iter().map(|a| a.value.clone()).collect();
        let expected: Vec<Value> = (0..20).map(Value::Int).collect();
        assert_eq!(applied, expected);
        ctx.stop(ShutdownMode::Immediate).await;
    }
}
