//! Working-window resolution: an ordered chain of sources, each of which either
//! decides the day or passes.

use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use serde::Serialize;

use crate::model::{ShiftKind, Span, TrainerShift, TrainerState};
use crate::time;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShiftSourceKind {
    Shift,
    LegacyDayOff,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShiftWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// Carried alongside the window, never merged into it.
    pub break_window: Option<(NaiveTime, NaiveTime)>,
    pub source: ShiftSourceKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftViolation {
    OutsideWindow,
    DuringBreak { start: NaiveTime, end: NaiveTime },
}

impl ShiftWindow {
    pub fn span_on(&self, date: NaiveDate) -> Span {
        Span::new(time::at(date, self.start), time::at(date, self.end))
    }

    pub fn break_span_on(&self, date: NaiveDate) -> Option<Span> {
        self.break_window
            .map(|(s, e)| Span::new(time::at(date, s), time::at(date, e)))
    }

    /// Whole candidate inside the window; neither endpoint strictly inside the break.
    /// Starting exactly at the break start counts as inside; spanning the break does not.
    pub fn check(&self, date: NaiveDate, candidate: &Span) -> Result<(), ShiftViolation> {
        if !self.span_on(date).contains_span(candidate) {
            return Err(ShiftViolation::OutsideWindow);
        }
        if let Some((start, end)) = self.break_window {
            let brk = Span::new(time::at(date, start), time::at(date, end));
            let starts_inside = brk.start <= candidate.start && candidate.start < brk.end;
            let ends_inside = brk.start < candidate.end && candidate.end < brk.end;
            if starts_inside || ends_inside {
                return Err(ShiftViolation::DuringBreak { start, end });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShiftResolution {
    Working(ShiftWindow),
    DayOff { source: ShiftSourceKind },
}

impl ShiftResolution {
    pub fn window(&self) -> Option<&ShiftWindow> {
        match self {
            ShiftResolution::Working(w) => Some(w),
            ShiftResolution::DayOff { .. } => None,
        }
    }
}

/// One link in the fallback chain. `None` means "no opinion, ask the next one".
pub trait ShiftSource: Send + Sync {
    fn name(&self) -> &'static str;
    fn resolve(&self, trainer: &TrainerState, weekday: Weekday) -> Option<ShiftResolution>;
}

/// Fixed windows for the named shift kinds.
pub fn default_window(kind: ShiftKind) -> Option<(NaiveTime, NaiveTime)> {
    match kind {
        ShiftKind::Morning => Some((time::clock(7, 0), time::clock(15, 0))),
        ShiftKind::Afternoon => Some((time::clock(11, 0), time::clock(19, 0))),
        ShiftKind::Night => Some((time::clock(15, 0), time::clock(22, 0))),
        ShiftKind::Custom | ShiftKind::Off => None,
    }
}

/// Active per-weekday shift rows.
pub struct ModernShifts;

impl ShiftSource for ModernShifts {
    fn name(&self) -> &'static str {
        "trainer_shifts"
    }

    fn resolve(&self, trainer: &TrainerState, weekday: Weekday) -> Option<ShiftResolution> {
        let shift: &TrainerShift = trainer.shifts.get(&weekday).filter(|s| s.active)?;
        let (start, end) = match shift.kind {
            ShiftKind::Off => {
                return Some(ShiftResolution::DayOff {
                    source: ShiftSourceKind::Shift,
                });
            }
            ShiftKind::Custom => match (shift.custom_start, shift.custom_end) {
                (Some(s), Some(e)) if s < e => (s, e),
                _ => {
                    tracing::warn!(trainer = %trainer.id, ?weekday, "custom shift without a usable window");
                    return None;
                }
            },
            kind => default_window(kind)?,
        };
        Some(ShiftResolution::Working(ShiftWindow {
            start,
            end,
            break_window: shift.break_window(),
            source: ShiftSourceKind::Shift,
        }))
    }
}

/// Legacy day-off rows: can only say "day off".
pub struct LegacyDayOffs;

impl ShiftSource for LegacyDayOffs {
    fn name(&self) -> &'static str {
        "trainer_day_offs"
    }

    fn resolve(&self, trainer: &TrainerState, weekday: Weekday) -> Option<ShiftResolution> {
        trainer
            .day_offs
            .get(&weekday)
            .copied()
            .filter(|off| *off)
            .map(|_| ShiftResolution::DayOff {
                source: ShiftSourceKind::LegacyDayOff,
            })
    }
}

/// Operating hours, no break. Always decides.
pub struct DefaultWindow;

impl ShiftSource for DefaultWindow {
    fn name(&self) -> &'static str {
        "default"
    }

    fn resolve(&self, _trainer: &TrainerState, _weekday: Weekday) -> Option<ShiftResolution> {
        Some(ShiftResolution::Working(ShiftWindow {
            start: time::opening_time(),
            end: time::closing_time(),
            break_window: None,
            source: ShiftSourceKind::Default,
        }))
    }
}

pub struct ShiftResolver {
    sources: Vec<Box<dyn ShiftSource>>,
}

impl Default for ShiftResolver {
    fn default() -> Self {
        Self::new(vec![
            Box::new(ModernShifts),
            Box::new(LegacyDayOffs),
            Box::new(DefaultWindow),
        ])
    }
}

impl ShiftResolver {
    pub fn new(sources: Vec<Box<dyn ShiftSource>>) -> Self {
        Self { sources }
    }

    pub fn resolve(&self, trainer: &TrainerState, date: NaiveDate) -> ShiftResolution {
        let weekday = date.weekday();
        for source in &self.sources {
            if let Some(resolution) = source.resolve(trainer, weekday) {
                tracing::trace!(trainer = %trainer.id, %date, source = source.name(), "shift resolved");
                return resolution;
            }
        }
        // An empty chain means nobody vouched for the day.
        ShiftResolution::DayOff {
            source: ShiftSourceKind::Default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    // 2025-12-15 is a Monday
    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 12, 15).unwrap()
    }

    fn shift(kind: ShiftKind) -> TrainerShift {
        TrainerShift {
            trainer_id: Ulid::new(),
            weekday: Weekday::Mon,
            kind,
            custom_start: None,
            custom_end: None,
            break_start: None,
            break_end: None,
            active: true,
        }
    }

    fn trainer_with(shift: Option<TrainerShift>, day_off: Option<bool>) -> TrainerState {
        let mut ts = TrainerState::new(Ulid::new());
        if let Some(s) = shift {
            ts.shifts.insert(s.weekday, s);
        }
        if let Some(off) = day_off {
            ts.day_offs.insert(Weekday::Mon, off);
        }
        ts
    }

    fn span(h1: u32, m1: u32, h2: u32, m2: u32) -> Span {
        Span::new(time::at(monday(), time::clock(h1, m1)), time::at(monday(), time::clock(h2, m2)))
    }

    #[test]
    fn named_shift_uses_default_table() {
        let ts = trainer_with(Some(shift(ShiftKind::Afternoon)), None);
        let r = ShiftResolver::default().resolve(&ts, monday());
        let w = r.window().unwrap();
        assert_eq!((w.start, w.end), (time::clock(11, 0), time::clock(19, 0)));
        assert_eq!(w.source, ShiftSourceKind::Shift);
    }

    #[test]
    fn custom_shift_uses_explicit_times() {
        let mut s = shift(ShiftKind::Custom);
        s.custom_start = Some(time::clock(9, 30));
        s.custom_end = Some(time::clock(17, 0));
        let ts = trainer_with(Some(s), None);
        let w = *ShiftResolver::default().resolve(&ts, monday()).window().unwrap();
        assert_eq!((w.start, w.end), (time::clock(9, 30), time::clock(17, 0)));
    }

    #[test]
    fn kind_none_is_day_off_even_with_times() {
        let mut s = shift(ShiftKind::Off);
        s.custom_start = Some(time::clock(9, 0));
        s.custom_end = Some(time::clock(17, 0));
        let ts = trainer_with(Some(s), Some(false));
        assert_eq!(
            ShiftResolver::default().resolve(&ts, monday()),
            ShiftResolution::DayOff { source: ShiftSourceKind::Shift }
        );
    }

    #[test]
    fn shift_row_beats_legacy_day_off() {
        let ts = trainer_with(Some(shift(ShiftKind::Morning)), Some(true));
        assert!(ShiftResolver::default().resolve(&ts, monday()).window().is_some());
    }

    #[test]
    fn inactive_shift_falls_through_to_legacy() {
        let mut s = shift(ShiftKind::Morning);
        s.active = false;
        let ts = trainer_with(Some(s), Some(true));
        assert_eq!(
            ShiftResolver::default().resolve(&ts, monday()),
            ShiftResolution::DayOff { source: ShiftSourceKind::LegacyDayOff }
        );
    }

    #[test]
    fn no_rows_gives_full_operating_window() {
        let ts = trainer_with(None, Some(false));
        let w = *ShiftResolver::default().resolve(&ts, monday()).window().unwrap();
        assert_eq!((w.start, w.end), (time::clock(7, 0), time::clock(22, 0)));
        assert_eq!(w.break_window, None);
        assert_eq!(w.source, ShiftSourceKind::Default);
    }

    #[test]
    fn break_rule() {
        let mut s = shift(ShiftKind::Morning);
        s.break_start = Some(time::clock(12, 0));
        s.break_end = Some(time::clock(12, 30));
        let ts = trainer_with(Some(s), None);
        let w = *ShiftResolver::default().resolve(&ts, monday()).window().unwrap();
        let d = monday();

        // end inside the break
        assert!(matches!(w.check(d, &span(11, 45, 12, 15)), Err(ShiftViolation::DuringBreak { .. })));
        // start inside the break
        assert!(matches!(w.check(d, &span(12, 0, 13, 0)), Err(ShiftViolation::DuringBreak { .. })));
        // spans the break
        assert_eq!(w.check(d, &span(11, 30, 12, 45)), Ok(()));
        // ends exactly when the break starts, or ends exactly when it ends while starting before
        assert_eq!(w.check(d, &span(11, 0, 12, 0)), Ok(()));
        assert_eq!(w.check(d, &span(11, 30, 12, 30)), Ok(()));
        // starts when the break ends
        assert_eq!(w.check(d, &span(12, 30, 13, 30)), Ok(()));
        // past the shift end
        assert_eq!(w.check(d, &span(14, 30, 15, 30)), Err(ShiftViolation::OutsideWindow));
    }

    #[test]
    fn custom_chain_order_is_respected() {
        let ts = trainer_with(Some(shift(ShiftKind::Morning)), None);
        let resolver = ShiftResolver::new(vec![Box::new(DefaultWindow), Box::new(ModernShifts)]);
        let w = *resolver.resolve(&ts, monday()).window().unwrap();
        assert_eq!(w.source, ShiftSourceKind::Default);
        assert!(matches!(
            ShiftResolver::new(Vec::new()).resolve(&ts, monday()),
            ShiftResolution::DayOff { .. }
        ));
    }
}
