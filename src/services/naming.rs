//! Canonical service names.
//!
//! The data plane reports usage keyed by service name; these helpers are
//! the single source of the naming scheme so control commands and flow
//! accounting always join on the same strings.
//!
//! Local forwards use `<forwardId>_<userId>_<userTunnelId>`; federation
//! hops use `fed_svc_<runtimeId>`.

/// Reserved name for the panel's own API traffic in usage reports.
pub const WEB_API_SERVICE: &str = "web_api";

const FEDERATION_PREFIX: &str = "fed_svc_";

/// Service name for a committed federation reservation.
pub fn federation_service_name(runtime_id: i64) -> String {
    format!("{FEDERATION_PREFIX}{runtime_id}")
}

/// Base name for a customer forward.
pub fn forward_service_base(forward_id: i64, user_id: i64, user_tunnel_id: i64) -> String {
    format!("{forward_id}_{user_id}_{user_tunnel_id}")
}

/// Expand a forward base into the candidate bases a control command may
/// have to address. The current user-tunnel id comes first, then the
/// caller's preferred hints in order, then the `_0` anonymous fallback;
/// duplicates are dropped while preserving order.
pub fn forward_service_base_candidates(
    forward_id: i64,
    user_id: i64,
    user_tunnel_id: i64,
    preferred_user_tunnel_ids: &[i64],
) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(preferred_user_tunnel_ids.len() + 2);

    let mut push = |candidate: String, out: &mut Vec<String>| {
        if !out.contains(&candidate) {
            out.push(candidate);
        }
    };

    push(forward_service_base(forward_id, user_id, user_tunnel_id), &mut out);
    for &hint in preferred_user_tunnel_ids {
        push(forward_service_base(forward_id, user_id, hint), &mut out);
    }
    push(forward_service_base(forward_id, user_id, 0), &mut out);

    out
}

/// Concrete service names a control command targets.
///
/// Pause/Resume address the per-protocol services; DeleteService also
/// removes the bare base left behind by older node builds.
pub fn control_service_names(base: &str, command: &str) -> Vec<String> {
    let tcp = format!("{base}_tcp");
    let udp = format!("{base}_udp");

    if command.trim().eq_ignore_ascii_case("DeleteService") {
        vec![base.to_string(), tcp, udp]
    } else {
        vec![tcp, udp]
    }
}

/// Whether a command should fall back to the bare base name when the
/// suffixed services are unknown to the node. Only Pause/Resume carry
/// the legacy fallback; matching is case-insensitive.
pub fn should_try_legacy_single_service(command: &str) -> bool {
    let cmd = command.trim();
    cmd.eq_ignore_ascii_case("PauseService") || cmd.eq_ignore_ascii_case("ResumeService")
}

/// Parse a usage-report name into `(forward_id, user_id, user_tunnel_id)`.
///
/// Returns `None` for the reserved `web_api` name, federation names and
/// anything that is not three numeric underscore-separated parts
/// (suffixed protocol names like `12_34_56_tcp` parse by their first
/// three parts).
pub fn parse_forward_service_name(name: &str) -> Option<(i64, i64, i64)> {
    if name == WEB_API_SERVICE {
        return None;
    }

    let mut parts = name.split('_');
    let forward_id: i64 = parts.next()?.parse().ok()?;
    let user_id: i64 = parts.next()?.parse().ok()?;
    let user_tunnel_id: i64 = parts.next()?.parse().ok()?;
    Some((forward_id, user_id, user_tunnel_id))
}
