//! The status monitor, run by the SDK's own runner binary

use async_trait::async_trait;

use sdk_core::record::keys;
use sdk_core::{ComponentRecord, LaunchMode};

use crate::error::SdkResult;
use crate::plugin::{Plugin, PluginContext, PluginDescriptor, SourceTier};
use crate::supervisor::{LaunchCommand, LaunchSpec};

pub const DEFAULT_PORT: u16 = 56565;

#[derive(Debug, Clone)]
pub struct StatusMonitorPlugin {
    descriptor: PluginDescriptor,
}

impl StatusMonitorPlugin {
    pub fn new() -> Self {
        Self {
            descriptor: PluginDescriptor::new("status_monitor", SourceTier::Builtin)
                .with_default_port(DEFAULT_PORT)
                .with_reserved_ports([DEFAULT_PORT]),
        }
    }
}

impl Default for StatusMonitorPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for StatusMonitorPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    async fn install(&self, _ctx: &PluginContext<'_>) -> SdkResult<()> {
        tracing::info!("status_monitor ships with the SDK; nothing to install");
        Ok(())
    }

    async fn start(&self, ctx: &PluginContext<'_>) -> SdkResult<()> {
        let alloc = ctx.allocate()?;
        let port = alloc.port.unwrap_or(DEFAULT_PORT);
        let registry_file = ctx.app().paths().registry_file.display().to_string();

        let mut args = vec![
            "status-monitor".to_string(),
            "--port".to_string(),
            port.to_string(),
            "--registry".to_string(),
            registry_file,
        ];
        args.extend(ctx.inputs().component_args.iter().cloned());
        let command = LaunchCommand::new(ctx.app().launcher().runner().display().to_string())
            .with_args(args);

        let record = ComponentRecord::new(&alloc.id, ctx.component_type())
            .with_status_endpoint(format!("http://127.0.0.1:{port}/"))
            .with_metadata(keys::DATADIR, alloc.datadir.display().to_string())
            .with_metadata("port", port);
        let spec = LaunchSpec::new(command, record, ctx.log_file(&alloc.id)?);

        let mode = ctx.launch_mode(LaunchMode::Background);
        let record = ctx.launch(spec, mode).await?;
        if mode != LaunchMode::Inline {
            ctx.confirm_running(&record).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor() {
        let plugin = StatusMonitorPlugin::new();
        assert_eq!(plugin.descriptor().name, "status_monitor");
        assert_eq!(plugin.descriptor().default_port, Some(DEFAULT_PORT));
        assert!(plugin.descriptor().reserved_ports.contains(&DEFAULT_PORT));
    }
}
