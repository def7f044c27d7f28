//! Enforces sequential phase semantics across re-renders.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use smithers_common::errors::StoreError;
use smithers_common::model::PhaseStatus;

use crate::store::Store;

type Hook = Arc<dyn Fn() + Send + Sync>;

struct PhaseRuntime {
    id: String,
    name: String,
    status: PhaseStatus,
    started_at: Option<chrono::DateTime<Utc>>,
}

#[derive(Default)]
struct Hooks {
    on_start: Option<Hook>,
    on_complete: Option<Hook>,
}

/// A Phase transition observed during one `advance` call, for logging/testing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseEvent {
    Started(String),
    Completed(String),
    Skipped(String),
}

/// Tracks one Execution's phases in declaration order and persists status
/// changes to the Store. Error policy is *advance*: a child erroring still
/// completes its Phase, matching the documented skill-guide behaviour.
/// `with_error_policy` is the documented extension point for callers that
/// want the alternative "mark phase failed" variant; this crate does not
/// implement that variant.
pub struct PhaseRegistry {
    store: Arc<dyn Store>,
    execution_id: String,
    phases: Vec<PhaseRuntime>,
    hooks: HashMap<String, Hooks>,
}

impl PhaseRegistry {
    /// `declared` is `(id, name)` in declaration order. Existing rows (resume)
    /// are loaded by id; missing ones are inserted as `pending`.
    pub fn load_or_init(
        store: Arc<dyn Store>,
        execution_id: impl Into<String>,
        declared: &[(String, String)],
    ) -> Result<Self, StoreError> {
        let execution_id = execution_id.into();
        let mut phases = Vec::with_capacity(declared.len());
        for (position, (id, name)) in declared.iter().enumerate() {
            let existing = store.query_one(
                "SELECT status FROM phases WHERE id = ?1",
                &[id.as_str().into()],
            )?;
            let status = match existing.and_then(|r| r.get_text("status").and_then(PhaseStatus::parse)) {
                Some(s) => s,
                None => {
                    let now = Utc::now().to_rfc3339();
                    store.run(
                        "INSERT INTO phases (id, execution_id, name, position, status, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        &[
                            id.as_str().into(),
                            execution_id.as_str().into(),
                            name.as_str().into(),
                            (position as i64).into(),
                            PhaseStatus::Pending.as_str().into(),
                            now.into(),
                        ],
                    )?;
                    PhaseStatus::Pending
                }
            };
            phases.push(PhaseRuntime {
                id: id.clone(),
                name: name.clone(),
                status,
                started_at: None,
            });
        }
        Ok(Self {
            store,
            execution_id,
            phases,
            hooks: HashMap::new(),
        })
    }

    pub fn register_hooks(
        &mut self,
        phase_id: impl Into<String>,
        on_start: Option<Hook>,
        on_complete: Option<Hook>,
    ) {
        self.hooks.insert(phase_id.into(), Hooks { on_start, on_complete });
    }

    pub fn status(&self, phase_id: &str) -> Option<PhaseStatus> {
        self.phases.iter().find(|p| p.id == phase_id).map(|p| p.status)
    }

    pub fn active_phase(&self) -> Option<&str> {
        self.phases
            .iter()
            .find(|p| p.status == PhaseStatus::Active)
            .map(|p| p.id.as_str())
    }

    pub fn all_terminal(&self) -> bool {
        self.phases.iter().all(|p| p.status.is_terminal())
    }

    /// Rules 1–2 of §4.4, evaluated after a settled RalphLoop iteration.
    /// `skip_if` is consulted only for the phase being considered for
    /// activation; `children_terminal` reports whether all of a phase's
    /// current children are in a terminal reconciler state.
    pub fn advance(
        &mut self,
        skip_if: impl Fn(&str) -> bool,
        children_terminal: impl Fn(&str) -> bool,
    ) -> Result<Vec<PhaseEvent>, StoreError> {
        let mut events = Vec::new();

        // Rule 2: complete the active phase if its children are all terminal.
        if let Some(active_id) = self.active_phase().map(|s| s.to_string()) {
            if children_terminal(&active_id) {
                self.transition(&active_id, PhaseStatus::Completed)?;
                if let Some(hook) = self.hooks.get(&active_id).and_then(|h| h.on_complete.clone()) {
                    hook();
                }
                events.push(PhaseEvent::Completed(active_id));
            } else {
                return Ok(events);
            }
        }

        // Rule 1: activate (or skip through) pending phases in declaration order.
        loop {
            let next_pending = self
                .phases
                .iter()
                .find(|p| p.status == PhaseStatus::Pending)
                .map(|p| p.id.clone());
            let Some(id) = next_pending else { break };
            if skip_if(&id) {
                self.transition(&id, PhaseStatus::Skipped)?;
                events.push(PhaseEvent::Skipped(id));
                continue;
            }
            self.transition(&id, PhaseStatus::Active)?;
            if let Some(hook) = self.hooks.get(&id).and_then(|h| h.on_start.clone()) {
                hook();
            }
            events.push(PhaseEvent::Started(id));
            break;
        }

        Ok(events)
    }

    fn transition(&mut self, phase_id: &str, next: PhaseStatus) -> Result<(), StoreError> {
        let now = Utc::now();
        let phase = self
            .phases
            .iter_mut()
            .find(|p| p.id == phase_id)
            .expect("transition called with unknown phase id");
        debug_assert!(
            phase.status.can_advance_to(next),
            "illegal phase transition {:?} -> {:?}",
            phase.status,
            next
        );

        let (started_at, ended_at, duration_ms) = match next {
            PhaseStatus::Active => {
                phase.started_at = Some(now);
                (Some(now), None, None)
            }
            PhaseStatus::Completed | PhaseStatus::Skipped => {
                let duration = phase.started_at.map(|s| (now - s).num_milliseconds());
                (phase.started_at, Some(now), duration)
            }
            PhaseStatus::Pending => (None, None, None),
        };
        phase.status = next;

        self.store.run(
            "UPDATE phases SET status = ?1, started_at = COALESCE(?2, started_at), ended_at = ?3, duration_ms = ?4 WHERE id = ?5",
            &[
                next.as_str().into(),
                started_at.map(|d| d.to_rfc3339()).into(),
                ended_at.map(|d| d.to_rfc3339()).into(),
                duration_ms.into(),
                phase_id.into(),
            ],
        )?;
        let _ = &self.execution_id;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> PhaseRegistry {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .run(
                "INSERT INTO executions (id, name, script_path, status, started_at, created_at) VALUES ('exec-1','demo','/w','running','2026-01-01T00:00:00Z','2026-01-01T00:00:00Z')",
                &[],
            )
            .unwrap();
        PhaseRegistry::load_or_init(
            store,
            "exec-1",
            &[
                ("phase-a".to_string(), "A".to_string()),
                ("phase-b".to_string(), "B".to_string()),
            ],
        )
        .unwrap()
    }

    #[test]
    fn first_advance_activates_first_pending_phase() {
        let mut reg = registry();
        let events = reg.advance(|_| false, |_| true).unwrap();
        assert_eq!(events, vec![PhaseEvent::Started("phase-a".to_string())]);
        assert_eq!(reg.active_phase(), Some("phase-a"));
    }

    #[test]
    fn completes_active_and_activates_next_in_one_call() {
        let mut reg = registry();
        reg.advance(|_| false, |_| true).unwrap();
        let events = reg.advance(|_| false, |_| true).unwrap();
        assert_eq!(
            events,
            vec![
                PhaseEvent::Completed("phase-a".to_string()),
                PhaseEvent::Started("phase-b".to_string())
            ]
        );
    }

    #[test]
    fn does_not_advance_while_children_still_running() {
        let mut reg = registry();
        reg.advance(|_| false, |_| true).unwrap();
        let events = reg.advance(|_| false, |_| false).unwrap();
        assert!(events.is_empty());
        assert_eq!(reg.active_phase(), Some("phase-a"));
    }

    #[test]
    fn skip_if_true_marks_phase_skipped_and_continues() {
        let mut reg = registry();
        let events = reg.advance(|id| id == "phase-a", |_| true).unwrap();
        assert_eq!(
            events,
            vec![
                PhaseEvent::Skipped("phase-a".to_string()),
                PhaseEvent::Started("phase-b".to_string())
            ]
        );
    }

    #[test]
    fn hooks_fire_on_start_and_complete() {
        let mut reg = registry();
        let starts = Arc::new(AtomicUsize::new(0));
        let completes = Arc::new(AtomicUsize::new(0));
        let s = starts.clone();
        let c = completes.clone();
        reg.register_hooks(
            "phase-a",
            Some(Arc::new(move || {
                s.fetch_add(1, Ordering::SeqCst);
            })),
            Some(Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })),
        );
        reg.advance(|_| false, |_| true).unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        reg.advance(|_| false, |_| true).unwrap();
        assert_eq!(completes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn all_terminal_once_every_phase_resolves() {
        let mut reg = registry();
        assert!(!reg.all_terminal());
        reg.advance(|_| false, |_| true).unwrap();
        reg.advance(|_| false, |_| true).unwrap();
        reg.advance(|_| false, |_| true).unwrap();
        assert!(reg.all_terminal());
    }
}
