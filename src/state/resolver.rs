//! Election Resolver
//!
//! Pure decision function for the pair election. Given the local node's
//! view of peer/arbiter reachability, computes the next role. No I/O, no
//! clocks: staleness is already folded into reachability by the heartbeat
//! layer, which reports a silent process as unreachable once its liveness
//! window lapses.
//!
//! The arbiter casts no vote of its own. Its mere reachability stands in
//! for a 2-of-3 quorum: if the local node can see the arbiter, it is not
//! the partitioned side. With both peer and arbiter unreachable no side
//! can prove majority, and the node refuses to elect.

use crate::state::node::Role;

/// What the peer reported about itself on the last heartbeat round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerReport {
    pub role: Role,
    pub epoch: u64,
}

/// One tick's worth of reachability observations
#[derive(Debug, Clone, Copy)]
pub struct ElectionInputs {
    /// Local role going into this tick
    pub local_role: Role,
    /// Peer's self-report, `None` when unreachable (or silent past its
    /// liveness window)
    pub peer: Option<PeerReport>,
    /// Whether the arbiter answered within the window
    pub arbiter_reachable: bool,
    /// Whether at least one successful heartbeat round with the peer has
    /// completed since this process started
    pub peer_observed: bool,
    /// Whether this node may claim mastership (previously synced, or
    /// started fresh with an empty dataset)
    pub electable: bool,
    /// Deterministic tie-break: true when the local address orders after
    /// the peer address
    pub local_precedence: bool,
}

/// Where the resolver believes the master is after a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterIs {
    Local,
    Peer,
    Unknown,
}

/// Outcome of one resolver evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub role: Role,
    pub master: MasterIs,
}

impl Decision {
    fn local_master() -> Self {
        Decision { role: Role::Master, master: MasterIs::Local }
    }

    fn slave_of_peer() -> Self {
        Decision { role: Role::Slave, master: MasterIs::Peer }
    }

    fn negotiating() -> Self {
        Decision { role: Role::Negotiating, master: MasterIs::Unknown }
    }

    fn hold(role: Role) -> Self {
        Decision {
            role,
            master: match role {
                Role::Master => MasterIs::Local,
                _ => MasterIs::Unknown,
            },
        }
    }
}

/// Evaluate the election rule for one heartbeat tick.
///
/// Deterministic and idempotent: identical inputs always produce the
/// identical decision, so repeated ticks with an unchanged view cause no
/// role flapping.
pub fn resolve(inputs: &ElectionInputs) -> Decision {
    match inputs.peer {
        // Peer answered this round
        Some(report) => resolve_with_peer(inputs, report),

        // Peer unreachable, arbiter reachable: quorum substitute
        None if inputs.arbiter_reachable => {
            if inputs.local_role == Role::Master {
                // An established master keeps serving while it can still
                // see the arbiter
                return Decision::local_master();
            }
            // A node that has not yet completed a heartbeat round with
            // the peer since startup must not claim mastership, even with
            // the arbiter visible: it may be rejoining next to an
            // established master it simply has not heard from yet.
            if !inputs.peer_observed {
                return Decision::negotiating();
            }
            if inputs.electable {
                Decision::local_master()
            } else {
                // Cannot serve as master; hold the current role and keep
                // waiting for the peer
                Decision::hold(inputs.local_role)
            }
        }

        // Both peer and arbiter unreachable: no majority on either side
        None => Decision::negotiating(),
    }
}

fn resolve_with_peer(inputs: &ElectionInputs, report: PeerReport) -> Decision {
    if report.role == Role::Master {
        // Never contest an active master
        if inputs.local_role == Role::Master {
            // Both sides master: a healed partition. Precedence decides
            // who demotes; the loser re-syncs from the survivor.
            if inputs.local_precedence {
                return Decision::local_master();
            }
            return Decision::slave_of_peer();
        }
        return Decision::slave_of_peer();
    }

    // Peer is Slave or Negotiating: no master visible on that side
    if inputs.local_role == Role::Master {
        return Decision::local_master();
    }

    // Neither side is master; deterministic precedence breaks the tie
    if inputs.electable && inputs.local_precedence {
        Decision::local_master()
    } else {
        // The peer holds (or will claim) precedence
        Decision::slave_of_peer()
    }
}
