//! The host: top-level controller owning planets, the app registry, and
//! session issuance.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use planet_spec::{AttrSchema, PlanetError, PlanetId, PlanetResult, DEFAULT_APP_FOR_DATA_MODEL};
use tracing::info;

use crate::app::App;
use crate::config::HostConfig;
use crate::context::{Context, LifecycleState, ShutdownMode};
use crate::planet::Planet;
use crate::session::HostSession;

#[derive(Default)]
struct AppIndex {
    by_app_uri: HashMap<String, Arc<dyn App>>,
    by_data_model: HashMap<String, Arc<dyn App>>,
}

/// Apps keyed by app URI and by each data model URI they claim.
#[derive(Default)]
pub struct AppRegistry {
    index: RwLock<AppIndex>,
}

impl AppRegistry {
    /// Registers `app` under its app URI and every data model URI it declares.
    ///
    /// Fails without registering anything if any of those URIs is taken.
    pub fn register(&self, app: Arc<dyn App>) -> PlanetResult<()> {
        let app_uri = app.app_uri().to_string();
        if app_uri.is_empty() || app_uri == DEFAULT_APP_FOR_DATA_MODEL {
            return Err(PlanetError::InvalidApp(format!("bad app uri {app_uri:?}")));
        }
        let mut data_models = app.data_model_uris();
        data_models.sort();
        data_models.dedup();

        let mut index = self.index.write();
        if index.by_app_uri.contains_key(&app_uri) {
            return Err(PlanetError::AppConflict(app_uri));
        }
        if let Some(taken) = data_models
            .iter()
            .find(|uri| index.by_data_model.contains_key(uri.as_str()))
        {
            return Err(PlanetError::AppConflict(taken.clone()));
        }
        for uri in data_models {
            index.by_data_model.insert(uri, app.clone());
        }
        info!(app_uri = %app_uri, "registered app");
        index.by_app_uri.insert(app_uri, app);
        Ok(())
    }

    /// Selects the app for `schema`: explicit app URI, then exact data model,
    /// then the default app.
    pub fn select(&self, schema: &AttrSchema) -> PlanetResult<Arc<dyn App>> {
        let index = self.index.read();
        if let Some(app_uri) = schema.explicit_app_uri() {
            return index
                .by_app_uri
                .get(app_uri)
                .cloned()
                .ok_or_else(|| PlanetError::AppNotFound(app_uri.to_string()));
        }
        index
            .by_data_model
            .get(&schema.data_model_uri)
            .or_else(|| index.by_data_model.get(DEFAULT_APP_FOR_DATA_MODEL))
            .cloned()
            .ok_or_else(|| PlanetError::AppNotFound(schema.data_model_uri.clone()))
    }

    /// Number of registered apps.
    pub fn len(&self) -> usize {
        self.index.read().by_app_uri.len()
    }

    /// True when no app is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Highest level controller. Planets are its children; sessions are
/// children of the home planet.
pub struct Host {
    ctx: Arc<Context>,
    config: HostConfig,
    home: Arc<Planet>,
    planets: RwLock<HashMap<PlanetId, Arc<Planet>>>,
    apps: Arc<AppRegistry>,
    next_session_id: AtomicU64,
}

impl Host {
    /// Builds a host and its home planet in the `Created` state.
    pub fn new(config: HostConfig) -> PlanetResult<Arc<Self>> {
        let ctx = Context::root("host");
        let home_id = PlanetId(config.home_planet_id);
        let home = Planet::new(home_id, ctx.child(format!("planet-{home_id}"))?, &config);
        let mut planets = HashMap::new();
        planets.insert(home_id, home.clone());
        Ok(Arc::new(Self {
            ctx,
            config,
            home,
            planets: RwLock::new(planets),
            apps: Arc::new(AppRegistry::default()),
            next_session_id: AtomicU64::new(1),
        }))
    }

    /// Moves the host and its planets to `Running`.
    pub fn start(&self) -> PlanetResult<()> {
        self.ctx.start()?;
        for planet in self.planets.read().values() {
            planet.context().start()?;
        }
        info!(home_planet = %self.home.planet_id(), "host running");
        Ok(())
    }

    /// Host configuration.
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// The home planet.
    pub fn host_planet(&self) -> &Arc<Planet> {
        &self.home
    }

    /// Mounts an additional planet, started if the host is running.
    pub fn mount_planet(&self, planet_id: PlanetId) -> PlanetResult<Arc<Planet>> {
        let mut planets = self.planets.write();
        if let Some(planet) = planets.get(&planet_id) {
            return Ok(planet.clone());
        }
        let planet = Planet::new(
            planet_id,
            self.ctx.child(format!("planet-{planet_id}"))?,
            &self.config,
        );
        if self.ctx.is_running() {
            planet.context().start()?;
        }
        planets.insert(planet_id, planet.clone());
        info!(planet_id = %planet_id, "mounted planet");
        Ok(planet)
    }

    /// Looks up a mounted planet.
    pub fn planet(&self, planet_id: PlanetId) -> PlanetResult<Arc<Planet>> {
        self.planets
            .read()
            .get(&planet_id)
            .cloned()
            .ok_or(PlanetError::PlanetNotFound(planet_id))
    }

    /// Registers an app for invocation by its app URI and data model URIs.
    pub fn register_app(&self, app: Arc<dyn App>) -> PlanetResult<()> {
        self.apps.register(app)
    }

    /// Selects the app serving `schema`.
    pub fn select_app_for_schema(&self, schema: &AttrSchema) -> PlanetResult<Arc<dyn App>> {
        self.apps.select(schema)
    }

    /// Opens a new session bound to the home planet.
    pub fn start_new_session(&self) -> PlanetResult<Arc<HostSession>> {
        if !self.ctx.is_running() {
            return Err(PlanetError::NotRunning(self.ctx.label().to_string()));
        }
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        HostSession::start(
            session_id,
            self.home.clone(),
            self.apps.clone(),
            &self.config,
        )
    }

    /// Lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.ctx.state()
    }

    /// Lifecycle context.
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Stops every planet and session, resolving once the host is `Stopped`.
    pub async fn stop(&self, mode: ShutdownMode) {
        info!(?mode, "host stopping");
        self.ctx.stop(mode).await;
        info!("host stopped");
    }

    /// Resolves once the host is `Stopped`.
    pub async fn done(&self) {
        self.ctx.done().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{CellReq, Resolution};
    use async_trait::async_trait;

    struct StubApp {
        uri: &'static str,
        models: Vec<&'static str>,
    }

    #[async_trait]
    impl App for StubApp {
        fn app_uri(&self) -> &str {
            self.uri
        }
        fn data_model_uris(&self) -> Vec<String> {
            self.models.iter().map(|m| m.to_string()).collect()
        }
        async fn resolve_request(&self, req: &CellReq) -> PlanetResult<Resolution> {
            Err(PlanetError::UnknownUri(req.pin_uri.clone()))
        }
    }

    fn stub(uri: &'static str, models: &[&'static str]) -> Arc<dyn App> {
        Arc::new(StubApp {
            uri,
            models: models.to_vec(),
        })
    }

    #[test]
    fn explicit_app_uri_wins() {
        let apps = AppRegistry::default();
        apps.register(stub("acme/docs/v1.0.0", &["planet/doc"])).unwrap();
        apps.register(stub("acme/special/v1.0.0", &[])).unwrap();
        let schema = AttrSchema::new("planet/doc").for_app("acme/special/v1.0.0");
        assert_eq!(apps.select(&schema).unwrap().app_uri(), "acme/special/v1.0.0");
        let schema = AttrSchema::new("planet/doc");
        assert_eq!(apps.select(&schema).unwrap().app_uri(), "acme/docs/v1.0.0");
    }

    #[test]
    fn explicit_app_uri_does_not_fall_back() {
        let apps = AppRegistry::default();
        apps.register(stub("acme/docs/v1.0.0", &["planet/doc"])).unwrap();
        let schema = AttrSchema::new("planet/doc").for_app("acme/missing/v1.0.0");
        assert_eq!(
            apps.select(&schema).err().unwrap(),
            PlanetError::AppNotFound("acme/missing/v1.0.0".into())
        );
    }

    #[test]
    fn default_app_catches_unclaimed_models() {
        let apps = AppRegistry::default();
        assert!(apps.select(&AttrSchema::new("planet/any")).is_err());
        apps.register(stub("acme/default/v1.0.0", &[DEFAULT_APP_FOR_DATA_MODEL]))
            .unwrap();
        let schema = AttrSchema::new("planet/any").for_app(DEFAULT_APP_FOR_DATA_MODEL);
        assert_eq!(apps.select(&schema).unwrap().app_uri(), "acme/default/v1.0.0");
    }

    #[test]
    fn conflicting_registration_is_atomic() {
        let apps = AppRegistry::default();
        apps.register(stub("acme/docs/v1.0.0", &["planet/doc"])).unwrap();
        let err = apps
            .register(stub("acme/other/v1.0.0", &["planet/note", "planet/doc"]))
            .unwrap_err();
        assert_eq!(err, PlanetError::AppConflict("planet/doc".into()));
        assert_eq!(apps.len(), 1);
        assert!(apps.select(&AttrSchema::new("planet/note")).is_err());
        assert!(matches!(
            apps.register(stub("acme/docs/v1.0.0", &[])),
            Err(PlanetError::AppConflict(_))
        ));
    }

    #[tokio::test]
    async fn sessions_require_a_running_host() {
        let host = Host::new(HostConfig::default()).unwrap();
        assert!(host.start_new_session().is_err());
        host.start().unwrap();
        let session = host.start_new_session().unwrap();
        assert!(session.logged_in().is_none());
        host.stop(ShutdownMode::Immediate).await;
        assert_eq!(host.state(), LifecycleState::Stopped);
        assert!(session.is_closed());
        assert!(host.start_new_session().is_err());
    }

    #[tokio::test]
    async fn mounted_planets_have_separate_symbols() {
        let host = Host::new(HostConfig::default()).unwrap();
        host.start().unwrap();
        let other = host.mount_planet(PlanetId(9)).unwrap();
        assert!(other.context().is_running());
        let a = host.host_planet().get_symbol_id(b"x", true).unwrap();
        assert_eq!(other.get_symbol_id(b"x", false).unwrap(), planet_spec::SymbolId::NIL);
        assert!(!a.is_nil());
        assert_eq!(host.planet(PlanetId(9)).unwrap().planet_id(), PlanetId(9));
        assert!(host.planet(PlanetId(10)).is_err());
        host.stop(ShutdownMode::Immediate).await;
        assert_eq!(other.context().state(), LifecycleState::Stopped);
    }
}
