//! Verb execution
//!
//! The controller turns parsed [`CliInputs`] into plugin calls. Verbs without a
//! component fan out over every component type in name order; a failure scoped to one
//! component is logged and the fan-out carries on.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use sdk_core::{SdkConfig, Snapshot};

use crate::app_state::AppState;
use crate::cli::{self, CliInputs, GrammarSource, Namespace, PROGRAM_NAME, top_level_command};
use crate::error::{NetworkError, SdkError, SdkResult, UsageError};
use crate::node_rpc::{self, RpcEndpoint};
use crate::plugin::PluginContext;
use crate::plugin::builtin::{node, status_monitor};
use crate::plugin::context::clear_dir;
use crate::supervisor::{self, LivenessConfig};

/// Component type of the status monitor sidecar
pub const STATUS_MONITOR: &str = "status_monitor";

/// Component type of the bundled node
pub const NODE: &str = "node";

/// Instance addressed by `node` when no `--id` is given
pub const DEFAULT_NODE_ID: &str = "node1";

/// Timeout of a single `node` RPC call
pub const NODE_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs verbs against the engine state
pub struct Controller {
    app: AppState,
    /// Bring the status monitor up before other components start
    ensure_status_monitor: bool,
}

impl Controller {
    pub fn new(app: AppState) -> Self {
        Self {
            app,
            ensure_status_monitor: true,
        }
    }

    pub fn without_status_monitor(mut self) -> Self {
        self.ensure_status_monitor = false;
        self
    }

    pub fn app(&self) -> &AppState {
        &self.app
    }

    /// Execute one parsed invocation
    pub async fn dispatch(&self, inputs: &CliInputs) -> SdkResult<()> {
        debug!(namespace = %inputs.namespace, component = ?inputs.selected_component, "Dispatching");
        match inputs.namespace {
            Namespace::Install => self.install(inputs).await,
            Namespace::Start => self.start(inputs).await,
            Namespace::Stop => self.stop(inputs).await,
            Namespace::Reset => self.reset(inputs).await,
            Namespace::Node => {
                let result = self.node(inputs).await?;
                println!("{}", render_rpc_result(&result));
                Ok(())
            }
            Namespace::Status => {
                let snapshot = self.status(inputs)?;
                println!("{}", serde_json::to_string_pretty(&snapshot).unwrap_or_default());
                Ok(())
            }
            Namespace::Config => {
                let config = self.config(inputs)?;
                println!("{}", serde_json::to_string_pretty(&config).unwrap_or_default());
                Ok(())
            }
            Namespace::TopLevel => {
                let mut cmd = top_level_command(&self.app.plugins().names());
                println!("{}", cmd.render_help());
                Ok(())
            }
        }
    }

    pub async fn install(&self, inputs: &CliInputs) -> SdkResult<()> {
        match inputs.selected_component.as_deref() {
            Some(component) => self.run_plugin(component, inputs).await,
            None => self.fan_out(&self.app.plugins().names(), inputs).await,
        }
    }

    pub async fn start(&self, inputs: &CliInputs) -> SdkResult<()> {
        self.app.plugins().check_reserved_ports()?;

        let component = match inputs.selected_component.clone() {
            Some(component) => Some(component),
            None => match inputs.component_id.as_deref() {
                Some(id) => Some(self.type_of(id)?),
                None => None,
            },
        };

        if self.ensure_status_monitor && component.as_deref() != Some(STATUS_MONITOR) {
            self.ensure_status_monitor().await;
        }

        match component {
            Some(component) => self.run_plugin(&component, inputs).await,
            None => {
                let names: Vec<String> = self
                    .app
                    .plugins()
                    .names()
                    .into_iter()
                    .filter(|name| name != STATUS_MONITOR)
                    .collect();
                self.fan_out(&names, inputs).await
            }
        }
    }

    /// Stop by `--id`, by component type, or everything in the registry.
    ///
    /// Stopping everything visits types in name order with the status monitor last.
    pub async fn stop(&self, inputs: &CliInputs) -> SdkResult<()> {
        if let Some(component) = inputs.selected_component.as_deref() {
            return self.run_plugin(component, inputs).await;
        }
        if let Some(id) = inputs.component_id.as_deref() {
            let component = self.type_of(id)?;
            return self.run_plugin(&component, inputs).await;
        }

        let mut types: Vec<String> = self
            .app
            .registry()
            .get_all()?
            .into_values()
            .map(|record| record.component_type)
            .collect();
        types.sort();
        types.dedup();
        if let Some(pos) = types.iter().position(|t| t == STATUS_MONITOR) {
            let monitor = types.remove(pos);
            types.push(monitor);
        }

        let mut first_error = None;
        for component_type in types {
            let result = if self.app.plugins().is_known(&component_type) {
                self.run_plugin(&component_type, &for_component(inputs, &component_type))
                    .await
            } else {
                self.stop_orphans(&component_type).await
            };
            if let Err(e) = result {
                note_failure(&component_type, e, &mut first_error)?;
            }
        }
        info!("Stopped all components");
        first_error.map_or(Ok(()), Err)
    }

    /// Reset by `--id`, by component type, or every component type except the monitor
    pub async fn reset(&self, inputs: &CliInputs) -> SdkResult<()> {
        if let Some(component) = inputs.selected_component.as_deref() {
            self.run_plugin(component, inputs).await?;
            info!("Reset of {} complete", inputs.component_id.as_deref().unwrap_or(component));
            return Ok(());
        }
        if let Some(id) = inputs.component_id.as_deref() {
            let component = self.type_of(id)?;
            self.run_plugin(&component, inputs).await?;
            info!("Reset of {} complete", id);
            return Ok(());
        }

        let names: Vec<String> = self
            .app
            .plugins()
            .names()
            .into_iter()
            .filter(|name| name != STATUS_MONITOR)
            .collect();
        self.fan_out(&names, inputs).await?;
        info!("Reset of all components complete");
        Ok(())
    }

    /// Forward an RPC call to a running node and return its `result`
    pub async fn node(&self, inputs: &CliInputs) -> SdkResult<Value> {
        let (id, rpc_args) = cli::parse_node_args(&inputs.node_args)?;
        let id = id.unwrap_or_else(|| DEFAULT_NODE_ID.to_string());
        let Some((method, params)) = rpc_args.split_first() else {
            return Err(UsageError::MissingRpcMethod.into());
        };

        let record = self
            .app
            .registry()
            .get_by_id(&id)?
            .ok_or_else(|| NetworkError::NodeNotFound(id.clone()))?;
        if record.component_type != NODE {
            return Err(UsageError::IdTypeMismatch {
                id,
                actual: record.component_type,
                requested: NODE.to_string(),
            }
            .into());
        }

        let endpoint = RpcEndpoint::from_record(&record, node::DEFAULT_RPC_PORT);
        let client = node_rpc::client(NODE_RPC_TIMEOUT)?;
        let params = node_rpc::coerce_args(params);
        Ok(node_rpc::call(&client, &endpoint, method, params).await?)
    }

    /// Registry contents, optionally restricted to one type or one id
    pub fn status(&self, inputs: &CliInputs) -> SdkResult<Snapshot> {
        Ok(self.app.registry().filter(
            inputs.selected_component.as_deref(),
            inputs.component_id.as_deref(),
        )?)
    }

    /// Persist `--sdk-home-dir`, or return the active configuration
    pub fn config(&self, inputs: &CliInputs) -> SdkResult<SdkConfig> {
        match inputs.sdk_home_dir.as_deref() {
            Some(dir) => {
                let bootstrap = sdk_core::paths::default_home()?.join("config.json");
                let dir = std::path::absolute(dir)?;
                persist_home_dir(&bootstrap, &dir)
            }
            None => Ok(self.app.config().clone()),
        }
    }

    /// On the very first invocation, purge generated scripts and reset the bundled node
    pub async fn handle_first_run(&self) -> SdkResult<()> {
        if !self.app.config().is_first_run {
            return Ok(());
        }
        info!("Running the SDK for the first time, please wait for configuration to complete");

        let paths = self.app.paths();
        clear_dir(&paths.shell_scripts)?;

        let inputs = CliInputs::new(Namespace::Reset).with_component(NODE);
        if let Err(e) = self.run_plugin(NODE, &inputs).await {
            warn!("First-run node reset failed: {}", e);
        }

        let mut config = self.app.config().clone();
        config.is_first_run = false;
        config.save(&paths.config_file)?;
        info!("First-run configuration complete");
        Ok(())
    }

    async fn run_plugin(&self, component: &str, inputs: &CliInputs) -> SdkResult<()> {
        let plugin = self.app.plugins().load(component)?;
        let ctx = PluginContext::new(&self.app, inputs, plugin.descriptor());
        match inputs.namespace {
            Namespace::Install => plugin.install(&ctx).await,
            Namespace::Start => plugin.start(&ctx).await,
            Namespace::Stop => plugin.stop(&ctx).await,
            Namespace::Reset => plugin.reset(&ctx).await,
            other => {
                debug!("{} has no plugin hook", other);
                Ok(())
            }
        }
    }

    async fn fan_out(&self, components: &[String], inputs: &CliInputs) -> SdkResult<()> {
        let mut first_error = None;
        for component in components {
            let scoped = for_component(inputs, component);
            if let Err(e) = self.run_plugin(component, &scoped).await {
                note_failure(component, e, &mut first_error)?;
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Component type of the record registered under `id`
    fn type_of(&self, id: &str) -> SdkResult<String> {
        self.app
            .registry()
            .get_by_id(id)?
            .map(|record| record.component_type)
            .ok_or_else(|| UsageError::UnknownId(id.to_string()).into())
    }

    /// Records whose plugin is no longer installed are stopped without a grace period
    async fn stop_orphans(&self, component_type: &str) -> SdkResult<()> {
        warn!("No plugin for '{}', stopping its records directly", component_type);
        for record in self.app.registry().get_by_type(component_type)? {
            supervisor::stop_component(self.app.registry(), &record, Duration::ZERO).await?;
        }
        Ok(())
    }

    async fn ensure_status_monitor(&self) {
        if self.status_monitor_alive().await {
            debug!("Status monitor already running");
            return;
        }
        let mut inputs = CliInputs::new(Namespace::Start).with_component(STATUS_MONITOR);
        inputs.background_flag = true;
        if let Err(e) = self.run_plugin(STATUS_MONITOR, &inputs).await {
            warn!("Status monitor could not be started: {}", e);
        }
    }

    async fn status_monitor_alive(&self) -> bool {
        let records = match self.app.registry().get_by_type(STATUS_MONITOR) {
            Ok(records) => records,
            Err(e) => {
                warn!("Cannot read the registry: {}", e);
                return false;
            }
        };
        let endpoint = records
            .iter()
            .find(|r| r.is_running())
            .and_then(|r| r.status_endpoint.clone())
            .unwrap_or_else(|| format!("http://127.0.0.1:{}/", status_monitor::DEFAULT_PORT));
        let quick = LivenessConfig::default()
            .with_retries(2)
            .with_interval(Duration::from_millis(500));
        supervisor::is_running_http(&endpoint, &quick).await
    }
}

/// Copy of `inputs` with the component selected
fn for_component(inputs: &CliInputs, component: &str) -> CliInputs {
    let mut scoped = inputs.clone();
    scoped.selected_component = Some(component.to_string());
    scoped
}

/// Log a component-scoped failure and keep the first; engine errors abort
fn note_failure(component: &str, e: SdkError, first: &mut Option<SdkError>) -> SdkResult<()> {
    if !e.is_component_scoped() {
        return Err(e);
    }
    error!(component, "{} failed: {}", component, e);
    if first.is_none() {
        *first = Some(e);
    }
    Ok(())
}

/// Write `sdk_home_dir` into the bootstrap `config.json`, keeping other keys
pub fn persist_home_dir(config_file: &Path, home: &Path) -> SdkResult<SdkConfig> {
    let mut config = SdkConfig::load_file(config_file)?;
    config.sdk_home_dir = Some(PathBuf::from(home));
    config.save(config_file)?;
    info!(
        "SDK home set to {}; run `{} config` to check",
        home.display(),
        PROGRAM_NAME
    );
    Ok(config)
}

/// Strings print bare, everything else as pretty JSON
pub fn render_rpc_result(result: &Value) -> String {
    match result {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::port::tests::FakeProbe;
    use axum::Json;
    use axum::Router;
    use axum::routing::post;
    use sdk_core::record::keys;
    use sdk_core::{ComponentRecord, ComponentState};
    use serde_json::json;

    fn controller() -> Controller {
        Controller::new(AppState::for_tests(FakeProbe::default())).without_status_monitor()
    }

    fn stopped(id: &str, component_type: &str) -> ComponentRecord {
        ComponentRecord::new(id, component_type).with_state(ComponentState::Stopped)
    }

    #[tokio::test]
    async fn test_status_filters() {
        let controller = controller();
        let registry = controller.app().registry();
        registry.upsert(stopped("node1", "node")).unwrap();
        registry.upsert(stopped("node2", "node")).unwrap();
        registry.upsert(stopped("electrumx1", "electrumx")).unwrap();

        let all = controller.status(&CliInputs::new(Namespace::Status)).unwrap();
        assert_eq!(all.len(), 3);

        let nodes = controller
            .status(&CliInputs::new(Namespace::Status).with_component("node"))
            .unwrap();
        assert_eq!(nodes.keys().cloned().collect::<Vec<_>>(), vec!["node1", "node2"]);

        let one = controller
            .status(&CliInputs::new(Namespace::Status).with_id("electrumx1"))
            .unwrap();
        assert_eq!(one.len(), 1);
        assert!(one.contains_key("electrumx1"));

        // repeated reads agree
        assert_eq!(
            controller.status(&CliInputs::new(Namespace::Status)).unwrap(),
            all
        );
    }

    #[tokio::test]
    async fn test_stop_all_settles_every_record() {
        let controller = controller();
        let registry = controller.app().registry();
        registry
            .upsert(ComponentRecord::new("node1", "node").with_state(ComponentState::Running))
            .unwrap();
        registry
            .upsert(ComponentRecord::new("gone1", "retired_plugin").with_state(ComponentState::Running))
            .unwrap();
        registry.upsert(stopped("whatsonchain1", "whatsonchain")).unwrap();

        controller.stop(&CliInputs::new(Namespace::Stop)).await.unwrap();

        let all = registry.get_all().unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.values().all(|r| r.component_state == ComponentState::Stopped));
    }

    #[tokio::test]
    async fn test_stop_unknown_id() {
        let controller = controller();
        let err = controller
            .stop(&CliInputs::new(Namespace::Stop).with_id("ghost1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::Usage(UsageError::UnknownId(_))));
    }

    #[tokio::test]
    async fn test_reset_keeps_record_and_empties_datadir() {
        let controller = controller();
        let app = controller.app();
        app.registry().upsert(stopped("electrumx1", "electrumx")).unwrap();
        let datadir = app.paths().component_datadir("electrumx", "electrumx1");
        std::fs::create_dir_all(datadir.join("db")).unwrap();

        controller
            .reset(&CliInputs::new(Namespace::Reset).with_id("electrumx1"))
            .await
            .unwrap();

        assert!(app.registry().get_by_id("electrumx1").unwrap().is_some());
        assert!(datadir.is_dir());
        assert_eq!(std::fs::read_dir(&datadir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_node_requires_method() {
        let controller = controller();
        let mut inputs = CliInputs::new(Namespace::Node);
        inputs.node_args = vec!["--id=node1".to_string()];
        let err = controller.node(&inputs).await.unwrap_err();
        assert!(matches!(err, SdkError::Usage(UsageError::MissingRpcMethod)));
    }

    #[tokio::test]
    async fn test_node_without_record() {
        let controller = controller();
        let mut inputs = CliInputs::new(Namespace::Node);
        inputs.node_args = vec!["getinfo".to_string()];
        let err = controller.node(&inputs).await.unwrap_err();
        assert!(matches!(err, SdkError::Network(NetworkError::NodeNotFound(_))));
    }

    #[tokio::test]
    async fn test_node_pass_through() {
        let router = Router::new().route(
            "/",
            post(|Json(body): Json<Value>| async move {
                Json(json!({
                    "result": {"method": body["method"], "params": body["params"]},
                    "error": null,
                    "id": body["id"],
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let controller = controller();
        controller
            .app()
            .registry()
            .upsert(
                ComponentRecord::new("node2", "node")
                    .with_state(ComponentState::Running)
                    .with_metadata(keys::RPCPORT, port)
                    .with_metadata(keys::RPCHOST, "127.0.0.1"),
            )
            .unwrap();

        let mut inputs = CliInputs::new(Namespace::Node);
        inputs.node_args = ["--id", "node2", "generatetoaddress", "1", "addr", "true"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let result = controller.node(&inputs).await.unwrap();
        assert_eq!(result["method"], "generatetoaddress");
        assert_eq!(result["params"], json!([1, "addr", true]));
    }

    #[test]
    fn test_persist_home_dir_keeps_other_keys() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"is_first_run": false}"#).unwrap();

        let config = persist_home_dir(&path, &temp.path().join("elsewhere")).unwrap();
        assert!(!config.is_first_run);
        let loaded = SdkConfig::load_file(&path).unwrap();
        assert_eq!(loaded.sdk_home_dir, Some(temp.path().join("elsewhere")));
        assert!(!loaded.is_first_run);
    }

    #[tokio::test]
    async fn test_first_run_is_persisted_once() {
        let controller = controller();
        let paths = controller.app().paths().clone();
        std::fs::write(paths.shell_scripts.join("old.sh"), "echo").unwrap();

        controller.handle_first_run().await.unwrap();

        assert!(!SdkConfig::load_file(&paths.config_file).unwrap().is_first_run);
        assert_eq!(std::fs::read_dir(&paths.shell_scripts).unwrap().count(), 0);
    }

    #[test]
    fn test_render_rpc_result() {
        assert_eq!(render_rpc_result(&json!("deadbeef")), "deadbeef");
        assert_eq!(render_rpc_result(&json!(12)), "12");
    }
}
