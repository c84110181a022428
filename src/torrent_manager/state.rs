// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::torrent_manager::reconcile::Reconciled;
use crate::torrent_manager::{LifecycleEvent, PieceEntry, ProgressRecord, TorrentId};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ControllerPhase {
    #[default]
    Initializing,
    Started,
}

#[derive(Debug)]
pub enum Action {
    Start,
    AdmissionGranted,
    AdmissionDenied { holders: Vec<TorrentId> },
    RetryElapsed,
    ReconciliationDone(Box<Reconciled>),
    CheckTorrent,
    Completed,
    Shutdown,
}

impl Action {
    fn name(&self) -> &'static str {
        match self {
            Action::Start => "Start",
            Action::AdmissionGranted => "AdmissionGranted",
            Action::AdmissionDenied { .. } => "AdmissionDenied",
            Action::RetryElapsed => "RetryElapsed",
            Action::ReconciliationDone(_) => "ReconciliationDone",
            Action::CheckTorrent => "CheckTorrent",
            Action::Completed => "Completed",
            Action::Shutdown => "Shutdown",
        }
    }
}

#[derive(Debug, PartialEq)]
#[must_use]
pub enum Effect {
    RequestAdmission,
    ScheduleRetry,
    EmitLifecycle(LifecycleEvent),
    RunReconciliation,
    CommitPieces(Vec<PieceEntry>),
    PublishProgress(ProgressRecord),
    SetStatusStarted,
    StartTracker,
    ReleaseScratch,
    RecheckPieces,
    NotifyTrackerCompleted,
    Ignore {
        phase: ControllerPhase,
        action: &'static str,
    },
    Stop,
}

#[derive(Debug)]
pub struct ControllerState {
    pub torrent_id: TorrentId,
    pub phase: ControllerPhase,
    pub awaiting_admission: bool,
    pub reconciling: bool,
    pub denied_attempts: u32,
}

impl ControllerState {
    pub fn new(torrent_id: TorrentId) -> Self {
        Self {
            torrent_id,
            phase: ControllerPhase::Initializing,
            awaiting_admission: false,
            reconciling: false,
            denied_attempts: 0,
        }
    }

    pub fn update(&mut self, action: Action) -> Vec<Effect> {
        match (self.phase, action) {
            (_, Action::Shutdown) => vec![Effect::Stop],

            (ControllerPhase::Initializing, Action::Start)
                if !self.awaiting_admission && !self.reconciling =>
            {
                self.awaiting_admission = true;
                vec![Effect::RequestAdmission]
            }

            (ControllerPhase::Initializing, Action::AdmissionDenied { .. })
                if self.awaiting_admission =>
            {
                self.denied_attempts += 1;
                vec![Effect::ScheduleRetry]
            }

            (ControllerPhase::Initializing, Action::RetryElapsed) if self.awaiting_admission => {
                vec![Effect::RequestAdmission]
            }

            (ControllerPhase::Initializing, Action::AdmissionGranted)
                if self.awaiting_admission =>
            {
                self.awaiting_admission = false;
                self.reconciling = true;
                vec![
                    Effect::EmitLifecycle(LifecycleEvent::Checking),
                    Effect::RunReconciliation,
                ]
            }

            (ControllerPhase::Initializing, Action::ReconciliationDone(reconciled))
                if self.reconciling =>
            {
                self.reconciling = false;
                self.phase = ControllerPhase::Started;
                let Reconciled { pieces, progress } = *reconciled;
                vec![
                    Effect::CommitPieces(pieces),
                    Effect::PublishProgress(progress),
                    Effect::SetStatusStarted,
                    Effect::EmitLifecycle(LifecycleEvent::Started),
                    Effect::StartTracker,
                    Effect::ReleaseScratch,
                ]
            }

            (ControllerPhase::Started, Action::CheckTorrent) => vec![Effect::RecheckPieces],

            (ControllerPhase::Started, Action::Completed) => vec![
                Effect::NotifyTrackerCompleted,
                Effect::EmitLifecycle(LifecycleEvent::Completed),
            ],

            (phase, action) => vec![Effect::Ignore {
                phase,
                action: action.name(),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admitted_state() -> ControllerState {
        let mut state = ControllerState::new(TorrentId(1));
        let _ = state.update(Action::Start);
        let _ = state.update(Action::AdmissionGranted);
        state
    }

    fn reconciled() -> Box<Reconciled> {
        Box::new(Reconciled {
            pieces: Vec::new(),
            progress: ProgressRecord {
                total: 10,
                left: 10,
                ..Default::default()
            },
        })
    }

    #[test]
    fn test_start_requests_admission() {
        let mut state = ControllerState::new(TorrentId(1));
        assert_eq!(state.update(Action::Start), vec![Effect::RequestAdmission]);
        assert!(state.awaiting_admission);

        // A second start while waiting is ignored.
        assert!(matches!(
            state.update(Action::Start).as_slice(),
            [Effect::Ignore { .. }]
        ));
    }

    #[test]
    fn test_denial_schedules_retry_without_limit() {
        let mut state = ControllerState::new(TorrentId(1));
        let _ = state.update(Action::Start);

        for attempt in 1..=5 {
            let effects = state.update(Action::AdmissionDenied {
                holders: vec![TorrentId(2)],
            });
            assert_eq!(effects, vec![Effect::ScheduleRetry]);
            assert_eq!(state.denied_attempts, attempt);
            assert_eq!(
                state.update(Action::RetryElapsed),
                vec![Effect::RequestAdmission]
            );
        }
        assert_eq!(state.phase, ControllerPhase::Initializing);
    }

    #[test]
    fn test_grant_emits_checking_then_reconciles() {
        let mut state = ControllerState::new(TorrentId(1));
        let _ = state.update(Action::Start);
        assert_eq!(
            state.update(Action::AdmissionGranted),
            vec![
                Effect::EmitLifecycle(LifecycleEvent::Checking),
                Effect::RunReconciliation
            ]
        );
        assert!(state.reconciling);
        assert!(!state.awaiting_admission);
    }

    #[test]
    fn test_commit_effects_are_ordered() {
        let mut state = admitted_state();
        let effects = state.update(Action::ReconciliationDone(reconciled()));

        assert_eq!(
            effects,
            vec![
                Effect::CommitPieces(Vec::new()),
                Effect::PublishProgress(ProgressRecord {
                    total: 10,
                    left: 10,
                    ..Default::default()
                }),
                Effect::SetStatusStarted,
                Effect::EmitLifecycle(LifecycleEvent::Started),
                Effect::StartTracker,
                Effect::ReleaseScratch,
            ]
        );
        assert_eq!(state.phase, ControllerPhase::Started);
    }

    #[test]
    fn test_started_accepts_check_and_completed() {
        let mut state = admitted_state();
        let _ = state.update(Action::ReconciliationDone(reconciled()));

        assert_eq!(
            state.update(Action::CheckTorrent),
            vec![Effect::RecheckPieces]
        );
        for _ in 0..2 {
            assert_eq!(
                state.update(Action::Completed),
                vec![
                    Effect::NotifyTrackerCompleted,
                    Effect::EmitLifecycle(LifecycleEvent::Completed)
                ]
            );
        }
        assert_eq!(state.phase, ControllerPhase::Started);
    }

    #[test]
    fn test_out_of_phase_events_are_ignored() {
        let mut state = ControllerState::new(TorrentId(1));
        let _ = state.update(Action::Start);

        assert_eq!(
            state.update(Action::CheckTorrent),
            vec![Effect::Ignore {
                phase: ControllerPhase::Initializing,
                action: "CheckTorrent"
            }]
        );
        assert_eq!(
            state.update(Action::Completed),
            vec![Effect::Ignore {
                phase: ControllerPhase::Initializing,
                action: "Completed"
            }]
        );

        let _ = state.update(Action::AdmissionGranted);
        let _ = state.update(Action::ReconciliationDone(reconciled()));

        assert_eq!(
            state.update(Action::AdmissionGranted),
            vec![Effect::Ignore {
                phase: ControllerPhase::Started,
                action: "AdmissionGranted"
            }]
        );
        assert_eq!(
            state.update(Action::AdmissionDenied { holders: vec![] }),
            vec![Effect::Ignore {
                phase: ControllerPhase::Started,
                action: "AdmissionDenied"
            }]
        );
        assert_eq!(state.phase, ControllerPhase::Started);
    }

    #[test]
    fn test_shutdown_stops_in_any_phase() {
        let mut state = ControllerState::new(TorrentId(1));
        assert_eq!(state.update(Action::Shutdown), vec![Effect::Stop]);

        let mut state = admitted_state();
        let _ = state.update(Action::ReconciliationDone(reconciled()));
        assert_eq!(state.update(Action::Shutdown), vec![Effect::Stop]);
    }
}
