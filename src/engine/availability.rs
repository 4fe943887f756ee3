use crate::model::*;

// ── Interval arithmetic ───────────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both sorted by start and internally disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

// ── Day schedule ──────────────────────────────────────────────────

/// The parts of a working window not taken by the break, admin blocks or
/// (already buffered) bookings. Inputs need not be sorted.
pub fn free_windows(window: Span, busy: &[Span]) -> Vec<Span> {
    let mut busy: Vec<Span> = busy
        .iter()
        .filter(|s| s.overlaps(&window))
        .copied()
        .collect();
    busy.sort_by_key(|s| s.start);
    let busy = merge_overlapping(&busy);
    subtract_intervals(&[window], &busy)
}

/// Fixed-step slots laid from `window.start`; a slot is offered when it sits
/// wholly inside one free window. A trailing partial slot is dropped.
pub fn slot_grid(window: Span, free: &[Span], step: Ms) -> Vec<Span> {
    if step <= 0 {
        return Vec::new();
    }
    let mut slots = Vec::new();
    let mut start = window.start;
    while start + step <= window.end {
        let slot = Span::new(start, start + step);
        if free.iter().any(|f| f.contains_span(&slot)) {
            slots.push(slot);
        }
        start += step;
    }
    slots
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: Ms = MINUTE_MS;
    const H: Ms = HOUR_MS;

    #[test]
    fn subtract_edges_and_punches() {
        let base = vec![Span::new(0, 10 * H)];
        // touching at the edges removes nothing extra
        assert_eq!(
            subtract_intervals(&base, &[Span::new(10 * H, 11 * H)]),
            base
        );
        assert_eq!(
            subtract_intervals(&base, &[Span::new(H, 2 * H), Span::new(5 * H, 6 * H)]),
            vec![Span::new(0, H), Span::new(2 * H, 5 * H), Span::new(6 * H, 10 * H)]
        );
        assert!(subtract_intervals(&base, &[Span::new(-H, 11 * H)]).is_empty());
    }

    #[test]
    fn merge_joins_adjacent_and_overlapping() {
        let spans = vec![Span::new(0, H), Span::new(H, 2 * H), Span::new(90 * M, 3 * H), Span::new(4 * H, 5 * H)];
        assert_eq!(
            merge_overlapping(&spans),
            vec![Span::new(0, 3 * H), Span::new(4 * H, 5 * H)]
        );
    }

    #[test]
    fn free_windows_ignore_busy_outside_window() {
        let window = Span::new(7 * H, 15 * H);
        let busy = vec![
            Span::new(12 * H, 12 * H + 30 * M), // break
            Span::new(8 * H + 50 * M, 10 * H + 10 * M), // 9–10 booking, 10 min buffer
            Span::new(5 * H, 6 * H),
        ];
        assert_eq!(
            free_windows(window, &busy),
            vec![
                Span::new(7 * H, 8 * H + 50 * M),
                Span::new(10 * H + 10 * M, 12 * H),
                Span::new(12 * H + 30 * M, 15 * H),
            ]
        );
    }

    #[test]
    fn grid_skips_slots_touching_busy_time() {
        let window = Span::new(7 * H, 10 * H);
        let free = free_windows(window, &[Span::new(8 * H + 50 * M, 9 * H + 10 * M)]);
        let slots = slot_grid(window, &free, 30 * M);
        let starts: Vec<Ms> = slots.iter().map(|s| s.start).collect();
        // 8:30–9:00 and 9:00–9:30 both overlap the buffered booking
        assert_eq!(
            starts,
            vec![7 * H, 7 * H + 30 * M, 8 * H, 9 * H + 30 * M]
        );
    }

    #[test]
    fn grid_drops_trailing_partial_slot() {
        let window = Span::new(9 * H + 30 * M, 10 * H + 45 * M);
        let slots = slot_grid(window, &[window], 30 * M);
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[1], Span::new(10 * H, 10 * H + 30 * M));
        assert!(slot_grid(window, &[window], 0).is_empty());
    }
}
