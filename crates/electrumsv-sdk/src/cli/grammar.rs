//! Per-verb clap grammars
//!
//! Built with the clap builder API so plugins can append their own arguments before
//! parsing.

use clap::{Arg, ArgAction, Command};

use super::Namespace;

/// Binary name used in help output
pub const PROGRAM_NAME: &str = "electrumsv-sdk";

fn id_arg(help: &'static str) -> Arg {
    Arg::new("id").long("id").value_name("ID").help(help)
}

fn repo_arg() -> Arg {
    Arg::new("repo")
        .long("repo")
        .value_name("URL_OR_PATH")
        .help("git repo as an https url or a local checkout path (optional)")
}

fn branch_arg() -> Arg {
    Arg::new("branch")
        .long("branch")
        .value_name("BRANCH")
        .help("git repo branch (optional)")
}

fn flag(id: &'static str, long: &'static str, help: &'static str) -> Arg {
    Arg::new(id).long(long).action(ArgAction::SetTrue).help(help)
}

fn components_help(components: &[String]) -> String {
    format!("Components: {}", components.join(", "))
}

/// Grammar for a single verb
pub fn verb_command(namespace: Namespace, components: &[String]) -> Command {
    let cmd = Command::new(namespace.as_str()).bin_name(format!("{PROGRAM_NAME} {}", namespace.as_str()));
    match namespace {
        Namespace::Install => cmd
            .about("install component dependencies")
            .arg(flag("background", "background", "install in the background"))
            .arg(id_arg("human-readable identifier for the component (e.g. 'worker1_esv')"))
            .arg(repo_arg())
            .arg(branch_arg())
            .after_help(components_help(components)),
        Namespace::Start => cmd
            .about("specify which servers to run")
            .arg(flag("new", "new", "run a new instance with a unique id"))
            .arg(flag("gui", "gui", "run in gui mode (wallet only)"))
            .arg(flag("background", "background", "spawn in the background"))
            .arg(flag("inline", "inline", "spawn in the current shell"))
            .arg(flag("new_terminal", "new-terminal", "spawn in a new terminal window"))
            .arg(id_arg("human-readable identifier for the component (e.g. 'worker1_esv')"))
            .arg(repo_arg())
            .arg(branch_arg())
            .after_help(components_help(components)),
        Namespace::Stop => cmd
            .about("stop spawned components")
            .arg(id_arg("human-readable identifier for the component (e.g. 'electrumsv1')"))
            .after_help(components_help(components)),
        Namespace::Reset => cmd
            .about("reset state of the selected components to genesis")
            .arg(id_arg("human-readable identifier for the component (e.g. 'electrumsv1')"))
            .arg(repo_arg())
            .arg(branch_arg())
            .after_help(components_help(components)),
        Namespace::Node => node_command(),
        Namespace::Status => cmd
            .about("show the status of components")
            .arg(id_arg("human-readable identifier for the component (e.g. 'electrumsv1')"))
            .after_help(components_help(components)),
        Namespace::Config => cmd
            .about("view or change persisted SDK configuration")
            .arg(
                Arg::new("sdk_home_dir")
                    .long("sdk-home-dir")
                    .value_name("PATH")
                    .help("relocate the SDK home directory"),
            ),
        Namespace::TopLevel => top_level_command(components),
    }
}

/// Options understood by the node RPC pass-through. Everything else is RPC input.
pub fn node_command() -> Command {
    Command::new(Namespace::Node.as_str())
        .bin_name(format!("{PROGRAM_NAME} node"))
        .about("direct access to the node's RPC commands")
        .override_usage("electrumsv-sdk node [--id=<node-id>] <method> [args...]")
        .arg(id_arg("select node instance by unique identifier"))
}

/// Top-level grammar, used for `--help` and `--version`
pub fn top_level_command(components: &[String]) -> Command {
    let mut cmd = Command::new(PROGRAM_NAME)
        .about("ElectrumSV Software Development Kit")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(false)
        .after_help(components_help(components));
    for namespace in Namespace::VERBS {
        cmd = cmd.subcommand(verb_command(namespace, components));
    }
    cmd
}

/// Long flag (without dashes) for an argument id, if the grammar declares one
pub fn long_for_id(cmd: &Command, id: &str) -> Option<String> {
    cmd.get_arguments()
        .find(|arg| arg.get_id().as_str() == id)
        .and_then(|arg| arg.get_long())
        .map(str::to_string)
}

/// Whether `cmd` declares the long option named by `token`; short options always count
pub fn declares_option(cmd: &Command, token: &str) -> bool {
    let Some(long) = token.strip_prefix("--") else {
        return true;
    };
    let name = long.split_once('=').map_or(long, |(name, _)| name);
    cmd.get_arguments().any(|arg| arg.get_long() == Some(name))
}

/// Whether the option named by `token` (e.g. `--id` or `--id=x`) expects a separate value
pub fn option_takes_value(cmd: &Command, token: &str) -> bool {
    let Some(long) = token.strip_prefix("--") else {
        return false;
    };
    if long.contains('=') {
        return false;
    }
    cmd.get_arguments()
        .find(|arg| arg.get_long() == Some(long))
        .is_some_and(|arg| arg.get_action().takes_values())
}
