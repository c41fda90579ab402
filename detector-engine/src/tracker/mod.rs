//! PlayDurationTracker: one state machine per station, turning a stream of
//! track-resolution outcomes into finalized Detection rows.
//!
//! The tracker never touches the database. It decides what happened and
//! hands the owning worker a list of [`TrackerEffect`]s to persist — keeping
//! per-station state owned by exactly one worker with no locking, per the
//! engine's concurrency model.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::db::detections::{Detection, DetectionMethod};

/// No Playing session runs longer than this without the worker forcing a
/// fresh resolver cascade (the ISRC fast-path is not trusted indefinitely).
pub const MAX_PLAY_SECONDS: i64 = 180;

#[derive(Debug, Clone, PartialEq)]
enum TrackerState {
    Idle,
    Playing {
        detection_id: Uuid,
        track_id: Uuid,
        confidence: f32,
        method: DetectionMethod,
        session_start: DateTime<Utc>,
        last_seen: DateTime<Utc>,
    },
    Interrupted {
        detection_id: Uuid,
        track_id: Uuid,
        confidence: f32,
        method: DetectionMethod,
        session_accum_seconds: f64,
        silence_start: DateTime<Utc>,
    },
}

/// What the current chunk's classification/resolution produced.
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    Match {
        track_id: Uuid,
        confidence: f32,
        method: DetectionMethod,
    },
    NoTrack,
}

/// A persistence side effect the owning worker must apply.
#[derive(Debug, Clone)]
pub enum TrackerEffect {
    Start(Detection),
    Finalize {
        detection_id: Uuid,
        track_id: Uuid,
        confidence: f32,
        method: DetectionMethod,
        duration_seconds: f64,
    },
}

pub struct PlayDurationTracker {
    station_id: Uuid,
    merge_window: Duration,
    state: TrackerState,
}

impl PlayDurationTracker {
    pub fn new(station_id: Uuid, merge_window_secs: u64) -> Self {
        Self {
            station_id,
            merge_window: Duration::seconds(merge_window_secs as i64),
            state: TrackerState::Idle,
        }
    }

    /// True while the current Playing session has run uninterrupted past
    /// [`MAX_PLAY_SECONDS`] — the worker should bypass the ISRC shortcut and
    /// run the full resolver cascade on the next chunk.
    pub fn exceeds_max_play(&self, now: DateTime<Utc>) -> bool {
        match &self.state {
            TrackerState::Playing { session_start, .. } => {
                now.signed_duration_since(*session_start) >= Duration::seconds(MAX_PLAY_SECONDS)
            }
            _ => false,
        }
    }

    /// Force-finalize and restart the current Playing session once it has
    /// run past [`MAX_PLAY_SECONDS`], rather than trusting one continuous
    /// session indefinitely. A no-op outside the Playing state. Caller is
    /// expected to have already re-run the resolver cascade for the current
    /// chunk (this worker never trusts a cached ISRC, so that already
    /// happens on every chunk) before calling this.
    pub fn force_resplit(&mut self, now: DateTime<Utc>) -> Vec<TrackerEffect> {
        match &self.state {
            TrackerState::Playing {
                detection_id,
                track_id,
                confidence,
                method,
                session_start,
                last_seen,
            } => {
                let finalize = TrackerEffect::Finalize {
                    detection_id: *detection_id,
                    track_id: *track_id,
                    confidence: *confidence,
                    method: *method,
                    duration_seconds: seconds_between(*session_start, *last_seen),
                };
                let detection = Detection::start(self.station_id, *track_id, *confidence, *method);
                let next = TrackerState::Playing {
                    detection_id: detection.id,
                    track_id: *track_id,
                    confidence: *confidence,
                    method: *method,
                    session_start: now,
                    last_seen: now,
                };
                self.state = next;
                vec![finalize, TrackerEffect::Start(detection)]
            }
            _ => Vec::new(),
        }
    }

    /// Periodic (60s) cleanup sweep: finalizes an Interrupted state whose
    /// station has gone quiet past the merge window, for stations that never
    /// emit the triggering `NoTrack` event because the stream itself died.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<TrackerEffect> {
        if matches!(self.state, TrackerState::Interrupted { .. }) {
            self.on_event(TrackerEvent::NoTrack, now)
        } else {
            Vec::new()
        }
    }

    pub fn on_event(&mut self, event: TrackerEvent, now: DateTime<Utc>) -> Vec<TrackerEffect> {
        let state = std::mem::replace(&mut self.state, TrackerState::Idle);
        let (next_state, effects) = match (state, event) {
            (TrackerState::Idle, TrackerEvent::Match { track_id, confidence, method }) => {
                let detection = Detection::start(self.station_id, track_id, confidence, method);
                let next = TrackerState::Playing {
                    detection_id: detection.id,
                    track_id,
                    confidence,
                    method,
                    session_start: now,
                    last_seen: now,
                };
                (next, vec![TrackerEffect::Start(detection)])
            }
            (TrackerState::Idle, TrackerEvent::NoTrack) => (TrackerState::Idle, Vec::new()),

            (
                TrackerState::Playing { detection_id, track_id, confidence, method, session_start, last_seen },
                TrackerEvent::Match { track_id: new_track, confidence: new_confidence, method: new_method },
            ) => {
                if new_track == track_id {
                    let next = TrackerState::Playing {
                        detection_id,
                        track_id,
                        confidence: new_confidence,
                        method: new_method,
                        session_start,
                        last_seen: now,
                    };
                    (next, Vec::new())
                } else {
                    let finalize = TrackerEffect::Finalize {
                        detection_id,
                        track_id,
                        confidence,
                        method,
                        duration_seconds: seconds_between(session_start, last_seen),
                    };
                    let detection = Detection::start(self.station_id, new_track, new_confidence, new_method);
                    let next = TrackerState::Playing {
                        detection_id: detection.id,
                        track_id: new_track,
                        confidence: new_confidence,
                        method: new_method,
                        session_start: now,
                        last_seen: now,
                    };
                    (next, vec![finalize, TrackerEffect::Start(detection)])
                }
            }
            (
                TrackerState::Playing { detection_id, track_id, confidence, method, session_start, last_seen },
                TrackerEvent::NoTrack,
            ) => {
                let next = TrackerState::Interrupted {
                    detection_id,
                    track_id,
                    confidence,
                    method,
                    session_accum_seconds: seconds_between(session_start, last_seen),
                    silence_start: now,
                };
                (next, Vec::new())
            }

            (
                TrackerState::Interrupted {
                    detection_id,
                    track_id,
                    confidence,
                    method,
                    session_accum_seconds,
                    silence_start,
                },
                TrackerEvent::Match { track_id: new_track, confidence: new_confidence, method: new_method },
            ) => {
                let within_window = now.signed_duration_since(silence_start) < self.merge_window;
                if new_track == track_id && within_window {
                    let shifted_start = now - Duration::milliseconds((session_accum_seconds * 1000.0) as i64);
                    let next = TrackerState::Playing {
                        detection_id,
                        track_id,
                        confidence: new_confidence,
                        method: new_method,
                        session_start: shifted_start,
                        last_seen: now,
                    };
                    (next, Vec::new())
                } else {
                    let finalize = TrackerEffect::Finalize {
                        detection_id,
                        track_id,
                        confidence,
                        method,
                        duration_seconds: session_accum_seconds,
                    };
                    let detection = Detection::start(self.station_id, new_track, new_confidence, new_method);
                    let next = TrackerState::Playing {
                        detection_id: detection.id,
                        track_id: new_track,
                        confidence: new_confidence,
                        method: new_method,
                        session_start: now,
                        last_seen: now,
                    };
                    (next, vec![finalize, TrackerEffect::Start(detection)])
                }
            }
            (
                TrackerState::Interrupted {
                    detection_id,
                    track_id,
                    confidence,
                    method,
                    session_accum_seconds,
                    silence_start,
                },
                TrackerEvent::NoTrack,
            ) => {
                if now.signed_duration_since(silence_start) >= self.merge_window {
                    let finalize = TrackerEffect::Finalize {
                        detection_id,
                        track_id,
                        confidence,
                        method,
                        duration_seconds: session_accum_seconds,
                    };
                    (TrackerState::Idle, vec![finalize])
                } else {
                    let next = TrackerState::Interrupted {
                        detection_id,
                        track_id,
                        confidence,
                        method,
                        session_accum_seconds,
                        silence_start,
                    };
                    (next, Vec::new())
                }
            }
        };
        self.state = next_state;
        effects
    }
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    end.signed_duration_since(start).num_milliseconds() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(seconds_offset: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(seconds_offset)
    }

    fn match_event(track_id: Uuid) -> TrackerEvent {
        TrackerEvent::Match {
            track_id,
            confidence: 0.9,
            method: DetectionMethod::Isrc,
        }
    }

    #[test]
    fn idle_match_starts_a_detection() {
        let station = Uuid::new_v4();
        let track = Uuid::new_v4();
        let mut tracker = PlayDurationTracker::new(station, 15);

        let effects = tracker.on_event(match_event(track), t(0));
        assert_eq!(effects.len(), 1);
        assert!(matches!(&effects[0], TrackerEffect::Start(d) if d.track_id == track));
    }

    #[test]
    fn short_interruption_merges_into_one_session() {
        let station = Uuid::new_v4();
        let track = Uuid::new_v4();
        let mut tracker = PlayDurationTracker::new(station, 15);

        tracker.on_event(match_event(track), t(0));
        for second in 1..40 {
            tracker.on_event(match_event(track), t(second));
        }
        // 8s silence, within the 15s merge window.
        for second in 40..48 {
            tracker.on_event(TrackerEvent::NoTrack, t(second));
        }
        tracker.on_event(match_event(track), t(48));
        for second in 49..100 {
            tracker.on_event(match_event(track), t(second));
        }
        let effects = tracker.on_event(TrackerEvent::NoTrack, t(100));
        // Still within merge window right after the last chunk; force past it.
        assert!(effects.is_empty());
        let effects = tracker.on_event(TrackerEvent::NoTrack, t(100 + 16));
        assert_eq!(effects.len(), 1);
        match &effects[0] {
            TrackerEffect::Finalize { duration_seconds, .. } => {
                assert!((*duration_seconds - 99.0).abs() < 1.0);
            }
            other => panic!("expected Finalize, got {other:?}"),
        }
    }

    #[test]
    fn long_interruption_produces_two_detections() {
        let station = Uuid::new_v4();
        let track = Uuid::new_v4();
        let mut tracker = PlayDurationTracker::new(station, 15);

        tracker.on_event(match_event(track), t(0));
        for second in 1..30 {
            tracker.on_event(match_event(track), t(second));
        }
        // 25s silence, past the 15s merge window.
        let mut finalize_seen = false;
        for second in 30..55 {
            let effects = tracker.on_event(TrackerEvent::NoTrack, t(second));
            if !effects.is_empty() {
                finalize_seen = true;
                assert!(matches!(effects[0], TrackerEffect::Finalize { .. }));
            }
        }
        assert!(finalize_seen, "interruption past merge window must finalize");

        let effects = tracker.on_event(match_event(track), t(60));
        assert_eq!(effects.len(), 1);
        assert!(matches!(&effects[0], TrackerEffect::Start(_)));
    }

    #[test]
    fn track_change_finalizes_prior_and_starts_new() {
        let station = Uuid::new_v4();
        let track_a = Uuid::new_v4();
        let track_b = Uuid::new_v4();
        let mut tracker = PlayDurationTracker::new(station, 15);

        tracker.on_event(match_event(track_a), t(0));
        for second in 1..50 {
            tracker.on_event(match_event(track_a), t(second));
        }
        let effects = tracker.on_event(match_event(track_b), t(50));
        assert_eq!(effects.len(), 2);
        match (&effects[0], &effects[1]) {
            (
                TrackerEffect::Finalize { track_id, duration_seconds, .. },
                TrackerEffect::Start(detection),
            ) => {
                assert_eq!(*track_id, track_a);
                assert!((*duration_seconds - 49.0).abs() < 1.0);
                assert_eq!(detection.track_id, track_b);
            }
            other => panic!("unexpected effects: {other:?}"),
        }
    }

    #[test]
    fn max_play_cap_flags_long_running_sessions() {
        let station = Uuid::new_v4();
        let track = Uuid::new_v4();
        let mut tracker = PlayDurationTracker::new(station, 15);

        tracker.on_event(match_event(track), t(0));
        assert!(!tracker.exceeds_max_play(t(170)));
        assert!(tracker.exceeds_max_play(t(181)));
    }

    #[test]
    fn force_resplit_caps_a_session_without_losing_the_track() {
        let station = Uuid::new_v4();
        let track = Uuid::new_v4();
        let mut tracker = PlayDurationTracker::new(station, 15);

        tracker.on_event(match_event(track), t(0));
        for second in 1..181 {
            tracker.on_event(match_event(track), t(second));
        }
        assert!(tracker.exceeds_max_play(t(181)));

        let effects = tracker.force_resplit(t(181));
        assert_eq!(effects.len(), 2);
        match (&effects[0], &effects[1]) {
            (TrackerEffect::Finalize { track_id, duration_seconds, .. }, TrackerEffect::Start(detection)) => {
                assert_eq!(*track_id, track);
                assert!((*duration_seconds - 180.0).abs() < 1.0);
                assert_eq!(detection.track_id, track);
            }
            other => panic!("unexpected effects: {other:?}"),
        }
        assert!(!tracker.exceeds_max_play(t(181)), "session clock resets after the split");
    }

    #[test]
    fn force_resplit_is_a_no_op_outside_playing() {
        let station = Uuid::new_v4();
        let mut tracker = PlayDurationTracker::new(station, 15);
        assert!(tracker.force_resplit(t(0)).is_empty());
    }

    #[test]
    fn sweep_finalizes_interrupted_station_that_stopped_sending_chunks() {
        let station = Uuid::new_v4();
        let track = Uuid::new_v4();
        let mut tracker = PlayDurationTracker::new(station, 15);

        tracker.on_event(match_event(track), t(0));
        tracker.on_event(TrackerEvent::NoTrack, t(10));
        assert!(tracker.sweep(t(20)).is_empty());
        let effects = tracker.sweep(t(30));
        assert_eq!(effects.len(), 1);
        assert!(matches!(effects[0], TrackerEffect::Finalize { .. }));
    }
}
