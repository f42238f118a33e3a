//! Promise state and microtask jobs
//!
//! A promise keeps its pending reactions until it settles; settling turns
//! each reaction into a job on the engine's microtask queue. A reaction with
//! no handler for the settled state passes the outcome straight through to
//! its derived promise, which is also how a promise adopts another one.

use jsenv::engine::{EngineValue, ObjRef, PromiseState};

#[derive(Clone, Debug)]
pub struct Reaction {
    pub on_fulfilled: Option<ObjRef>,
    pub on_rejected: Option<ObjRef>,
    /// Promise settled with the handler's outcome.
    pub derived: ObjRef,
}

impl Reaction {
    pub fn handler(&self, state: PromiseState) -> Option<ObjRef> {
        match state {
            PromiseState::Fulfilled => self.on_fulfilled,
            PromiseState::Rejected => self.on_rejected,
            PromiseState::Pending => None,
        }
    }
}

/// A reaction whose promise has settled.
#[derive(Clone, Debug)]
pub struct Job {
    pub reaction: Reaction,
    pub state: PromiseState,
    pub value: EngineValue,
}

impl Job {
    pub fn trace(&self, f: &mut impl FnMut(&EngineValue)) {
        trace_reaction(&self.reaction, f);
        f(&self.value);
    }
}

#[derive(Debug)]
pub struct PromiseData {
    pub state: PromiseState,
    pub result: EngineValue,
    pub reactions: Vec<Reaction>,
    pub handled: bool,
    /// Set once the host resolved or rejected it through its resolver.
    pub locked: bool,
}

impl Default for PromiseData {
    fn default() -> Self {
        PromiseData {
            state: PromiseState::Pending,
            result: EngineValue::Undefined,
            reactions: Vec::new(),
            handled: false,
            locked: false,
        }
    }
}

impl PromiseData {
    /// Settles a pending promise and returns the jobs to queue. A settled
    /// promise is left alone.
    pub fn settle(&mut self, state: PromiseState, value: EngineValue) -> Option<Vec<Job>> {
        if self.state != PromiseState::Pending || state == PromiseState::Pending {
            return None;
        }
        self.state = state;
        self.result = value.clone();
        let jobs = std::mem::take(&mut self.reactions)
            .into_iter()
            .map(|reaction| Job {
                reaction,
                state,
                value: value.clone(),
            })
            .collect();
        Some(jobs)
    }

    /// Registers `reaction`, returning a job right away if already settled.
    pub fn react(&mut self, reaction: Reaction, counts_as_handler: bool) -> Option<Job> {
        if counts_as_handler {
            self.handled = true;
        }
        if self.state == PromiseState::Pending {
            self.reactions.push(reaction);
            return None;
        }
        Some(Job {
            reaction,
            state: self.state,
            value: self.result.clone(),
        })
    }

    pub fn trace(&self, f: &mut impl FnMut(&EngineValue)) {
        f(&self.result);
        for reaction in &self.reactions {
            trace_reaction(reaction, f);
        }
    }
}

fn trace_reaction(reaction: &Reaction, f: &mut impl FnMut(&EngineValue)) {
    for obj in [reaction.on_fulfilled, reaction.on_rejected, Some(reaction.derived)]
        .into_iter()
        .flatten()
    {
        f(&EngineValue::Object(obj));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(index: u32) -> ObjRef {
        ObjRef::first(index)
    }

    #[test]
    fn test_settle_once() {
        let mut data = PromiseData::default();
        let reaction = Reaction {
            on_fulfilled: Some(obj(1)),
            on_rejected: None,
            derived: obj(2),
        };
        assert!(data.react(reaction, true).is_none());
        let jobs = data.settle(PromiseState::Fulfilled, EngineValue::Int(5)).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].reaction.handler(PromiseState::Fulfilled), Some(obj(1)));
        assert!(data.settle(PromiseState::Rejected, EngineValue::Null).is_none());
        assert_eq!(data.state, PromiseState::Fulfilled);
    }

    #[test]
    fn test_late_reaction_runs_immediately() {
        let mut data = PromiseData::default();
        data.settle(PromiseState::Rejected, EngineValue::Int(1));
        let job = data
            .react(
                Reaction {
                    on_fulfilled: None,
                    on_rejected: Some(obj(3)),
                    derived: obj(4),
                },
                true,
            )
            .unwrap();
        assert_eq!(job.state, PromiseState::Rejected);
        assert!(data.handled);
    }
}
