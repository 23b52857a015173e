//! Launch-time join request
//!
//! Directory clients start the program with `+connect_lobby <handle>` when
//! the user accepts an invitation. The pair is stripped from the argument
//! list before clap sees it. An unparsable or zero handle counts as absent.

use tracing::warn;

use crate::transport::SessionHandle;

/// Launcher-style join flag
pub const CONNECT_FLAG: &str = "+connect_lobby";

/// Parse a session handle given on the command line
pub fn parse_handle(raw: &str) -> Option<SessionHandle> {
    match raw.trim().parse::<u64>() {
        Ok(0) => None,
        Ok(raw) => Some(SessionHandle(raw)),
        Err(_) => {
            warn!("Ignoring invalid session handle {:?}", raw);
            None
        }
    }
}

/// Split `+connect_lobby <handle>` out of `args`.
///
/// Returns the remaining arguments and the requested session, if any.
/// With the flag given more than once, the last valid handle wins.
pub fn split_launch_args<I>(args: I) -> (Vec<String>, Option<SessionHandle>)
where
    I: IntoIterator<Item = String>,
{
    let mut rest = Vec::new();
    let mut target = None;
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        if arg != CONNECT_FLAG {
            rest.push(arg);
            continue;
        }
        match args.next() {
            Some(raw) => {
                if let Some(handle) = parse_handle(&raw) {
                    target = Some(handle);
                }
            }
            None => warn!("{} given without a session handle", CONNECT_FLAG),
        }
    }
    (rest, target)
}
