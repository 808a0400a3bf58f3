//! Token attribution
//!
//! One left-to-right pass that decides which tokens belong to the verb parser, which
//! token names the component, and which are left over for the component itself.

use clap::Command;

use super::grammar::{declares_option, option_takes_value};
use crate::error::UsageError;

/// Tokens after the verb, split by owner
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Attribution {
    pub verb_tokens: Vec<String>,
    pub component: Option<String>,
    pub trailing: Vec<String>,
}

/// Split the tokens of a component-taking verb.
///
/// Options before the component name go to the verb; an option that takes a value
/// and is written without `=` consumes the next token. An option `verb` does not
/// declare may belong to a plugin's grammar, so it consumes the next token unless that
/// token is a component name. The first bare token must be a known component name.
pub fn attribute(
    tokens: &[String],
    verb: &Command,
    is_known: impl Fn(&str) -> bool,
    known: impl Fn() -> Vec<String>,
) -> Result<Attribution, UsageError> {
    let mut out = Attribution::default();
    let mut iter = tokens.iter();

    while let Some(token) = iter.next() {
        if out.component.is_some() {
            out.trailing.push(token.clone());
            continue;
        }
        if token.starts_with('-') {
            out.verb_tokens.push(token.clone());
            let undeclared_with_value = !declares_option(verb, token)
                && !token.contains('=')
                && iter
                    .as_slice()
                    .first()
                    .is_some_and(|next| !next.starts_with('-') && !is_known(next));
            if option_takes_value(verb, token) || undeclared_with_value {
                if let Some(value) = iter.next() {
                    out.verb_tokens.push(value.clone());
                }
            }
            continue;
        }
        if !is_known(token) {
            return Err(UsageError::UnknownComponent {
                name: token.clone(),
                known: known().join(", "),
            });
        }
        out.component = Some(token.clone());
    }

    Ok(out)
}

/// Pull the plugin's own options out of the trailing tokens.
///
/// Returns `(verb_tokens, component_args)`. `extension_longs` are long flag names
/// without dashes.
pub fn route_extensions(
    trailing: Vec<String>,
    extended: &Command,
    extension_longs: &[String],
) -> (Vec<String>, Vec<String>) {
    let mut verb_tokens = Vec::new();
    let mut component_args = Vec::new();
    let mut iter = trailing.into_iter();

    while let Some(token) = iter.next() {
        let is_extension = token
            .strip_prefix("--")
            .map(|rest| rest.split_once('=').map_or(rest, |(name, _)| name))
            .is_some_and(|name| extension_longs.iter().any(|long| long == name));

        if !is_extension {
            component_args.push(token);
            continue;
        }
        let takes_value = option_takes_value(extended, &token);
        verb_tokens.push(token);
        if takes_value {
            if let Some(value) = iter.next() {
                verb_tokens.push(value);
            }
        }
    }

    (verb_tokens, component_args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Namespace;
    use crate::cli::grammar::verb_command;
    use clap::{Arg, ArgAction};

    fn strings(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|s| s.to_string()).collect()
    }

    fn known(name: &str) -> bool {
        matches!(name, "node" | "electrumx")
    }

    fn names() -> Vec<String> {
        strings(&["electrumx", "node"])
    }

    #[test]
    fn test_options_before_component_go_to_verb() {
        let cmd = verb_command(Namespace::Start, &[]);
        let tokens = strings(&["--new", "--id", "node5", "node", "-debug=1", "extra"]);
        let split = attribute(&tokens, &cmd, known, names).unwrap();
        assert_eq!(split.verb_tokens, strings(&["--new", "--id", "node5"]));
        assert_eq!(split.component.as_deref(), Some("node"));
        assert_eq!(split.trailing, strings(&["-debug=1", "extra"]));
    }

    #[test]
    fn test_unknown_component_is_rejected() {
        let cmd = verb_command(Namespace::Stop, &[]);
        let err = attribute(&strings(&["nodee"]), &cmd, known, names).unwrap_err();
        assert!(matches!(err, UsageError::UnknownComponent { ref name, .. } if name == "nodee"));
    }

    #[test]
    fn test_no_component() {
        let cmd = verb_command(Namespace::Stop, &[]);
        let split = attribute(&strings(&["--id=node1"]), &cmd, known, names).unwrap();
        assert_eq!(split.component, None);
        assert_eq!(split.verb_tokens, strings(&["--id=node1"]));
    }

    #[test]
    fn test_id_value_matching_component_name() {
        let cmd = verb_command(Namespace::Start, &[]);
        let split = attribute(&strings(&["--id", "node", "node"]), &cmd, known, names).unwrap();
        assert_eq!(split.verb_tokens, strings(&["--id", "node"]));
        assert_eq!(split.component.as_deref(), Some("node"));
    }

    #[test]
    fn test_undeclared_option_keeps_its_value_before_component() {
        let cmd = verb_command(Namespace::Start, &[]);
        let tokens = strings(&["--wallet", "w1", "electrumx"]);
        let split = attribute(&tokens, &cmd, known, names).unwrap();
        assert_eq!(split.verb_tokens, strings(&["--wallet", "w1"]));
        assert_eq!(split.component.as_deref(), Some("electrumx"));
    }

    #[test]
    fn test_undeclared_flag_before_component() {
        let cmd = verb_command(Namespace::Start, &[]);
        let split = attribute(&strings(&["--testnet", "node"]), &cmd, known, names).unwrap();
        assert_eq!(split.verb_tokens, strings(&["--testnet"]));
        assert_eq!(split.component.as_deref(), Some("node"));
    }

    #[test]
    fn test_route_extensions() {
        let cmd = verb_command(Namespace::Start, &[])
            .arg(Arg::new("testnet").long("testnet").action(ArgAction::SetTrue))
            .arg(Arg::new("wallet").long("wallet"));
        let exts = strings(&["testnet", "wallet"]);
        let (verb, rest) = route_extensions(
            strings(&["--testnet", "--wallet", "w1", "--other", "x"]),
            &cmd,
            &exts,
        );
        assert_eq!(verb, strings(&["--testnet", "--wallet", "w1"]));
        assert_eq!(rest, strings(&["--other", "x"]));
    }
}
