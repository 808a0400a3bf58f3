//! Command line dispatch
//!
//! `electrumsv-sdk <verb> [verb-flags] [component] [component-args...]`
//!
//! Parsing is two-phase: plugins are loaded first so the selected one can extend the
//! verb grammar, then the attributed tokens are fed to clap.

pub mod grammar;
pub mod tokens;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use clap::error::ErrorKind;
use clap::{ArgAction, ArgMatches, Command};
use serde_json::Value;

use crate::error::{PluginLoadError, SdkResult, UsageError};

pub use grammar::{PROGRAM_NAME, node_command, top_level_command, verb_command};

/// Top-level verb
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Namespace {
    Install,
    Start,
    Stop,
    Reset,
    Node,
    Status,
    Config,
    /// No verb: bare invocation
    #[default]
    TopLevel,
}

impl Namespace {
    pub const VERBS: [Namespace; 7] = [
        Namespace::Install,
        Namespace::Start,
        Namespace::Stop,
        Namespace::Reset,
        Namespace::Node,
        Namespace::Status,
        Namespace::Config,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Install => "install",
            Namespace::Start => "start",
            Namespace::Stop => "stop",
            Namespace::Reset => "reset",
            Namespace::Node => "node",
            Namespace::Status => "status",
            Namespace::Config => "config",
            Namespace::TopLevel => "",
        }
    }

    pub fn from_verb(verb: &str) -> Option<Self> {
        Self::VERBS.into_iter().find(|ns| ns.as_str() == verb)
    }

    /// Verbs of the form `<verb> [flags] [component] [component-args...]`
    pub fn takes_component(&self) -> bool {
        matches!(
            self,
            Namespace::Install
                | Namespace::Start
                | Namespace::Stop
                | Namespace::Reset
                | Namespace::Status
        )
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything one invocation asked for
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliInputs {
    pub namespace: Namespace,
    pub selected_component: Option<String>,
    pub component_id: Option<String>,
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub new_flag: bool,
    pub gui_flag: bool,
    pub background_flag: bool,
    pub inline_flag: bool,
    pub new_terminal_flag: bool,
    /// Tokens after the component name, forwarded to the plugin
    pub component_args: Vec<String>,
    /// Values of plugin-declared options, keyed by argument id
    pub cli_extension_args: BTreeMap<String, Value>,
    /// Raw tokens for the node RPC pass-through
    pub node_args: Vec<String>,
    /// `config --sdk-home-dir`
    pub sdk_home_dir: Option<PathBuf>,
}

impl CliInputs {
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            ..Default::default()
        }
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.selected_component = Some(component.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.component_id = Some(id.into());
        self
    }

    /// Boolean extension flag; absent or non-boolean values read as false
    pub fn extension_flag(&self, name: &str) -> bool {
        self.cli_extension_args
            .get(name)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn extension_str(&self, name: &str) -> Option<&str> {
        self.cli_extension_args.get(name).and_then(Value::as_str)
    }
}

/// What the dispatcher needs from the plugin catalogue
pub trait GrammarSource {
    /// Every known component type, sorted
    fn component_names(&self) -> Vec<String>;

    fn is_known(&self, name: &str) -> bool {
        self.component_names().iter().any(|known| known == name)
    }

    /// Let `component` extend the grammar of `namespace`.
    ///
    /// Returns the extended command and the ids of the arguments it added.
    fn extend_cli(
        &self,
        component: &str,
        namespace: Namespace,
        cmd: Command,
    ) -> Result<(Command, Vec<String>), PluginLoadError>;
}

/// Parse the tokens that follow the program name
pub fn parse(args: &[String], plugins: &dyn GrammarSource) -> SdkResult<CliInputs> {
    let components = plugins.component_names();

    let Some(first) = args.first() else {
        return Ok(CliInputs::new(Namespace::TopLevel));
    };

    let Some(namespace) = Namespace::from_verb(first) else {
        if first.starts_with('-') {
            let mut argv = vec![PROGRAM_NAME.to_string()];
            argv.extend(args.iter().cloned());
            let err = match top_level_command(&components).try_get_matches_from(argv) {
                Ok(_) => return Ok(CliInputs::new(Namespace::TopLevel)),
                Err(err) => err,
            };
            return Err(clap_error(err).into());
        }
        return Err(UsageError::UnknownVerb(first.clone()).into());
    };

    let rest = &args[1..];
    let mut inputs = CliInputs::new(namespace);

    match namespace {
        Namespace::Node => {
            inputs.node_args = rest.to_vec();
        }
        Namespace::Config => {
            if let Some(bare) = rest.iter().find(|t| !t.starts_with('-')) {
                // values of `--sdk-home-dir <path>` are allowed
                let is_value = rest
                    .iter()
                    .position(|t| t == bare)
                    .and_then(|i| i.checked_sub(1))
                    .is_some_and(|i| rest[i] == "--sdk-home-dir");
                if !is_value {
                    return Err(UsageError::UnexpectedArgument(bare.clone()).into());
                }
            }
            let matches = run_clap(verb_command(namespace, &components), rest)?;
            inputs.sdk_home_dir = matches.get_one::<String>("sdk_home_dir").map(PathBuf::from);
        }
        _ => {
            let base = verb_command(namespace, &components);
            let is_known = |name: &str| plugins.is_known(name);
            let known = || components.clone();
            let mut split = tokens::attribute(rest, &base, is_known, known)?;

            let (cmd, extension_ids) = match split.component.clone() {
                Some(component) => {
                    let (cmd, ids) = plugins.extend_cli(&component, namespace, base)?;
                    // the plugin's own options decide which tokens before the name are values
                    let again = tokens::attribute(rest, &cmd, is_known, known)?;
                    if again.component.as_deref() != Some(component.as_str()) {
                        return Err(UsageError::InvalidArgs(format!(
                            "Cannot tell which token names the component; put '{component}' before its options"
                        ))
                        .into());
                    }
                    split = again;
                    (cmd, ids)
                }
                None => (base, Vec::new()),
            };

            let extension_longs: Vec<String> = extension_ids
                .iter()
                .filter_map(|id| grammar::long_for_id(&cmd, id))
                .collect();
            let (routed, component_args) =
                tokens::route_extensions(split.trailing, &cmd, &extension_longs);

            let mut verb_tokens = split.verb_tokens;
            verb_tokens.extend(routed);

            let lookup = cmd.clone();
            let matches = run_clap(cmd, &verb_tokens)?;
            fill_verb_flags(&mut inputs, &matches, namespace);
            for id in extension_ids {
                let value = extension_value(&lookup, &matches, &id);
                inputs.cli_extension_args.insert(id, value);
            }
            inputs.selected_component = split.component;
            inputs.component_args = component_args;
        }
    }

    Ok(inputs)
}

/// Split `node` tokens into the `--id` selection and the RPC method with its arguments.
///
/// Options are only recognised before the method name.
pub fn parse_node_args(args: &[String]) -> SdkResult<(Option<String>, Vec<String>)> {
    let cmd = node_command();
    let mut options = Vec::new();
    let mut rest = args.iter();
    let mut rpc = Vec::new();
    while let Some(token) = rest.next() {
        if !token.starts_with('-') {
            rpc.push(token.clone());
            break;
        }
        options.push(token.clone());
        if grammar::option_takes_value(&cmd, token) {
            if let Some(value) = rest.next() {
                options.push(value.clone());
            }
        }
    }
    rpc.extend(rest.cloned());

    let matches = run_clap(cmd, &options)?;
    Ok((string_arg(&matches, "id"), rpc))
}

fn run_clap(cmd: Command, tokens: &[String]) -> Result<ArgMatches, UsageError> {
    let mut argv = vec![cmd.get_name().to_string()];
    argv.extend(tokens.iter().cloned());
    cmd.try_get_matches_from(argv).map_err(clap_error)
}

fn clap_error(err: clap::Error) -> UsageError {
    match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
            UsageError::Display(err.render().to_string())
        }
        _ => UsageError::InvalidArgs(err.render().to_string()),
    }
}

fn has_arg(matches: &ArgMatches, id: &str) -> bool {
    matches!(matches.try_contains_id(id), Ok(true))
}

fn string_arg(matches: &ArgMatches, id: &str) -> Option<String> {
    matches.try_get_one::<String>(id).ok().flatten().cloned()
}

fn flag_arg(matches: &ArgMatches, id: &str) -> bool {
    has_arg(matches, id) && matches.try_get_one::<bool>(id).ok().flatten().copied().unwrap_or(false)
}

fn fill_verb_flags(inputs: &mut CliInputs, matches: &ArgMatches, namespace: Namespace) {
    inputs.component_id = string_arg(matches, "id");
    inputs.repo = string_arg(matches, "repo");
    inputs.branch = string_arg(matches, "branch");
    inputs.background_flag = flag_arg(matches, "background");
    if namespace == Namespace::Start {
        inputs.new_flag = flag_arg(matches, "new");
        inputs.gui_flag = flag_arg(matches, "gui");
        inputs.inline_flag = flag_arg(matches, "inline");
        inputs.new_terminal_flag = flag_arg(matches, "new_terminal");
    }
}

fn extension_value(cmd: &Command, matches: &ArgMatches, id: &str) -> Value {
    let action = cmd
        .get_arguments()
        .find(|arg| arg.get_id().as_str() == id)
        .map(|arg| arg.get_action().clone());

    match action {
        Some(ArgAction::SetTrue) | Some(ArgAction::SetFalse) => {
            Value::Bool(matches.try_get_one::<bool>(id).ok().flatten().copied().unwrap_or(false))
        }
        Some(ArgAction::Count) => {
            Value::from(matches.try_get_one::<u8>(id).ok().flatten().copied().unwrap_or(0))
        }
        _ => {
            if let Some(s) = string_arg(matches, id) {
                Value::String(s)
            } else if let Ok(Some(n)) = matches.try_get_one::<i64>(id) {
                Value::from(*n)
            } else if let Ok(Some(n)) = matches.try_get_one::<u16>(id) {
                Value::from(*n)
            } else if let Ok(Some(b)) = matches.try_get_one::<bool>(id) {
                Value::Bool(*b)
            } else {
                Value::Null
            }
        }
    }
}
