//! Transport registration and dispatch
//!
//! This module provides a centralized registry for all transports, with
//! support for feature-gated inclusion and dynamic help text generation.

use crate::cli::TRANSPORT_NAMES;
use rmiflash_core::transport::RegisterTransport;

/// Information about a transport
pub struct TransportInfo {
    /// Primary name (used for matching)
    pub name: &'static str,
    /// Alternative names/aliases
    pub aliases: &'static [&'static str],
    /// Short description
    pub description: &'static str,
}

/// Get information about all available transports (enabled at compile time)
#[allow(unused_mut, clippy::vec_init_then_push)]
pub fn available_transports() -> Vec<TransportInfo> {
    let mut transports = Vec::new();

    #[cfg(feature = "dummy")]
    transports.push(TransportInfo {
        name: "dummy",
        aliases: &[],
        description: "Emulated RMI device for testing (variant=v0|v1|v7,bl=<n>,pid=<id>)",
    });

    #[cfg(feature = "hid")]
    transports.push(TransportInfo {
        name: "hid",
        aliases: &["hidraw", "i2c-hid"],
        description: "RMI over HID reports (dev=/dev/hidrawN,timeout=<ms>)",
    });

    #[cfg(feature = "ps2")]
    transports.push(TransportInfo {
        name: "ps2",
        aliases: &["serio", "psmouse"],
        description: "RMI over the PS/2 aux port (serio=serioN or dev=/dev/serio_rawN)",
    });

    transports
}

/// Generate help text listing all available transports
pub fn transport_help() -> String {
    let transports = available_transports();

    if transports.is_empty() {
        return "No transports available (recompile with transport features enabled)".to_string();
    }

    let mut help = String::from("Available transports:\n");
    for t in &transports {
        help.push_str(&format!("  {:8} - {}\n", t.name, t.description));
    }
    help
}

/// Generate a short list of transport names
pub fn transport_names_short() -> String {
    TRANSPORT_NAMES.join(", ")
}

/// Resolve a transport name or alias to its primary name
pub fn find_transport(name: &str) -> Option<&'static str> {
    available_transports()
        .into_iter()
        .find(|t| t.name == name || t.aliases.contains(&name))
        .map(|t| t.name)
}

/// Open the transport named by `name`
///
/// The string can be just the name (e.g., "hid") or include options
/// (e.g., "hid:dev=/dev/hidraw3").
pub fn open_transport(
    name: &str,
) -> Result<Box<dyn RegisterTransport>, Box<dyn std::error::Error>> {
    let (name, options) = parse_transport_string(name);

    let canonical_name = match find_transport(name) {
        Some(n) => n,
        None => return Err(unknown_transport_error(name)),
    };

    match canonical_name {
        #[cfg(feature = "dummy")]
        "dummy" => rmiflash_dummy::open_dummy(&options),

        #[cfg(feature = "hid")]
        "hid" => {
            log::info!("Opening hidraw transport...");
            rmiflash_hid::open_hid(&options).map_err(|e| {
                format!(
                    "Failed to open hidraw device: {}\nMake sure the node exists and you have permissions.",
                    e
                )
                .into()
            })
        }

        #[cfg(feature = "ps2")]
        "ps2" => {
            log::info!("Opening PS/2 transport...");
            rmiflash_ps2::open_ps2(&options).map_err(|e| {
                format!(
                    "Failed to open PS/2 port: {}\nSwitching the serio driver requires root.",
                    e
                )
                .into()
            })
        }

        _ => Err(unknown_transport_error(name)),
    }
}

/// Split `name:key=value,key=value` into the name and its options
///
/// A key without `=` gets an empty value.
pub fn parse_transport_string(s: &str) -> (&str, Vec<(&str, &str)>) {
    let Some((name, rest)) = s.split_once(':') else {
        return (s, Vec::new());
    };

    let options = rest
        .split(',')
        .filter(|opt| !opt.is_empty())
        .map(|opt| opt.split_once('=').unwrap_or((opt, "")))
        .collect();
    (name, options)
}

fn unknown_transport_error(name: &str) -> Box<dyn std::error::Error> {
    let names = transport_names_short();
    if names.is_empty() {
        format!(
            "Unknown transport: {}\nNo transports are enabled in this build.",
            name
        )
        .into()
    } else {
        format!("Unknown transport: {}\nAvailable transports: {}", name, names).into()
    }
}
