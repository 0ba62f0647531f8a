//! Live-variable queries over [`FnBody`] continuations.
//!
//! Unlike a whole-function dataflow fixpoint, liveness here is demand
//! driven: RC insertion asks for the free variables of one continuation
//! at a time. The IR is a tree, so a single walk suffices. Loops only go
//! through join points, and a jump contributes the live set recorded for
//! its target instead of re-walking the join point body.
//!
//! The statement spine (`Let`/`Join`/`USet`/`SSet`/`RcInc`/`RcDec`
//! chains) is walked iteratively; only `Case` alternatives and join point
//! bodies recurse.

use im_rc::{OrdMap, OrdSet};

use crate::ir::{FnBody, JoinPointId, Param, VarId};
use crate::stack::ensure_sufficient_stack;

/// Variables free in a continuation.
pub type LiveSet = OrdSet<VarId>;

/// Live set recorded for each join point in scope, parameters excluded.
pub type JoinPointLiveMap = OrdMap<JoinPointId, LiveSet>;

/// Record the live set of join point `id`.
///
/// `live` is the live set at the entry of the join point body; the join
/// point's own parameters are removed before it is stored.
#[must_use]
pub fn update_join_point_live_vars(
    map: &JoinPointLiveMap,
    id: JoinPointId,
    params: &[Param],
    live: LiveSet,
) -> JoinPointLiveMap {
    let mut live = live;
    for p in params {
        live.remove(&p.var);
    }
    map.update(id, live)
}

/// Free variables of `body`, unioned with `acc`.
///
/// `jps` supplies the live sets of the join points enclosing `body`.
/// Join points declared inside `body` are recorded on the fly, so jumps
/// to them resolve too.
pub fn collect_live_vars(body: &FnBody, jps: &JoinPointLiveMap, acc: LiveSet) -> LiveSet {
    let mut jps = jps.clone();
    let mut spine: Vec<&FnBody> = Vec::new();
    let mut cur = body;

    while let Some(cont) = cur.continuation() {
        if let FnBody::Join {
            id,
            params,
            body: jp_body,
            ..
        } = cur
        {
            let outer = jps.clone();
            let body_live =
                ensure_sufficient_stack(|| collect_live_vars(jp_body, &outer, LiveSet::new()));
            jps = update_join_point_live_vars(&jps, *id, params, body_live);
        }
        spine.push(cur);
        cur = cont;
    }

    let mut live = LiveSet::new();
    match cur {
        FnBody::Ret { value } => {
            if let Some(x) = value.as_var() {
                live.insert(x);
            }
        }
        FnBody::Jump { target, args } => {
            live.extend(args.iter().filter_map(|a| a.as_var()));
            if let Some(jp_live) = jps.get(target) {
                live = live.union(jp_live.clone());
            }
        }
        FnBody::Case {
            scrutinee, alts, ..
        } => {
            live.insert(*scrutinee);
            for alt in alts {
                live = ensure_sufficient_stack(|| collect_live_vars(alt.body(), &jps, live));
            }
        }
        // The spine loop stops only at terminals.
        FnBody::Unreachable
        | FnBody::Let { .. }
        | FnBody::Join { .. }
        | FnBody::USet { .. }
        | FnBody::SSet { .. }
        | FnBody::RcInc { .. }
        | FnBody::RcDec { .. } => {}
    }

    for stmt in spine.into_iter().rev() {
        if let Some(x) = stmt.defined_var() {
            live.remove(&x);
        }
        live.extend(stmt.used_vars());
    }
    // `acc` joins after the walk so a binding in `body` cannot drop it.
    live.union(acc)
}
