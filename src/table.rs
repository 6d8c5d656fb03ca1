//! Column width negotiation.
//!
//! Every column first receives its minimum (widest unbreakable cell content plus padding) or its
//! preset width. Slack is then shared equally between columns without a preset, each capped at
//! its widest content, unless the table has an explicit width, in which case the slack is spent
//! in full. When the minimums already exceed the container, columns above their minimum shrink
//! pro rata to their surplus; the minimums themselves never shrink.

use crate::types::Px;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ColumnRequest {
    pub min: Px,
    pub max: Px,
    pub preset: Option<Px>,
}

impl ColumnRequest {
    fn start_width(&self) -> Px {
        match self.preset {
            Some(preset) => preset.max(self.min),
            None => self.min,
        }
    }
}

/// Resolves column widths for `available` pixels of column space. `explicit` is the column space
/// of a table with a declared width.
pub fn negotiate(columns: &[ColumnRequest], available: Px, explicit: Option<Px>) -> Vec<Px> {
    let mut widths: Vec<Px> = columns.iter().map(ColumnRequest::start_width).collect();
    if widths.is_empty() {
        return widths;
    }
    let used: Px = widths.iter().sum();
    let target = explicit.unwrap_or(available);

    if used < target {
        let flexible: Vec<usize> = (0..columns.len())
            .filter(|&i| columns[i].preset.is_none())
            .collect();
        let (receivers, capped) = match (explicit.is_some(), flexible.is_empty()) {
            (true, true) => ((0..columns.len()).collect::<Vec<_>>(), false),
            (true, false) => (flexible, false),
            (false, _) => (flexible, true),
        };
        let caps: Vec<Px> = columns
            .iter()
            .zip(widths.iter())
            .map(|(c, w)| if capped { c.max.max(*w) } else { Px::UNBOUNDED })
            .collect();
        distribute(&mut widths, &receivers, &caps, target - used);
    } else if used > available && explicit.is_none() {
        shrink(&mut widths, columns, used - available);
    }
    widths
}

/// Water-fills `slack` into the receiving columns without passing their caps.
fn distribute(widths: &mut [Px], receivers: &[usize], caps: &[Px], slack: Px) {
    let mut remaining = slack.to_milli_i64();
    let mut open: Vec<usize> = receivers
        .iter()
        .copied()
        .filter(|&i| widths[i] < caps[i])
        .collect();
    while remaining > 0 && !open.is_empty() {
        let share = remaining / open.len() as i64;
        let extra = remaining % open.len() as i64;
        let mut progressed = false;
        for (n, &i) in open.iter().enumerate() {
            let want = share + i64::from((n as i64) < extra);
            let room = (caps[i] - widths[i]).to_milli_i64();
            let give = want.min(room).max(0);
            if give > 0 {
                widths[i] += Px::from_milli_i64(give);
                remaining -= give;
                progressed = true;
            }
        }
        open.retain(|&i| widths[i] < caps[i]);
        if !progressed {
            break;
        }
    }
}

fn shrink(widths: &mut [Px], columns: &[ColumnRequest], excess: Px) {
    let surplus: Vec<i64> = widths
        .iter()
        .zip(columns)
        .map(|(w, c)| (*w - c.min).to_milli_i64().max(0))
        .collect();
    let total: i64 = surplus.iter().sum();
    if total <= 0 {
        return;
    }
    let excess = excess.to_milli_i64().min(total);
    let mut taken = 0i64;
    let last = surplus.iter().rposition(|s| *s > 0).unwrap_or(0);
    for (i, s) in surplus.iter().enumerate() {
        if *s == 0 {
            continue;
        }
        let cut = if i == last {
            excess - taken
        } else {
            ((*s as i128 * excess as i128) / total as i128) as i64
        };
        widths[i] -= Px::from_milli_i64(cut);
        taken += cut;
    }
}

/// Horizontal space a table spends outside its columns.
pub fn overhead(columns: usize, spacing: Px, thickness: Px) -> Px {
    thickness * 2 + spacing * (columns as i32 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn px(v: i32) -> Px {
        Px::from_i32(v)
    }

    fn assert_near(actual: Px, milli: i64) {
        let got = actual.to_milli_i64();
        assert!((got - milli).abs() <= 1, "{got} is not within a milli of {milli}");
    }

    fn req(min: i32, max: i32) -> ColumnRequest {
        ColumnRequest {
            min: px(min),
            max: px(max),
            preset: None,
        }
    }

    #[test]
    fn slack_is_capped_at_content_width() {
        let widths = negotiate(&[req(14, 14), req(124, 124)], px(200), None);
        assert_eq!(widths, vec![px(14), px(124)]);
    }

    #[test]
    fn slack_is_shared_equally_until_caps() {
        let widths = negotiate(&[req(10, 20), req(10, 200)], px(100), None);
        assert_eq!(widths, vec![px(20), px(80)]);
    }

    #[test]
    fn explicit_width_is_filled_exactly() {
        let widths = negotiate(&[req(10, 10), req(10, 10)], px(500), Some(px(101)));
        assert_eq!(widths.iter().copied().sum::<Px>(), px(101));
        let mut preset = req(10, 10);
        preset.preset = Some(px(30));
        let widths = negotiate(&[preset, req(10, 10)], px(500), Some(px(100)));
        assert_eq!(widths, vec![px(30), px(70)]);
    }

    #[test]
    fn overflow_shrinks_pro_rata_above_minimums() {
        let mut a = req(10, 10);
        a.preset = Some(px(60));
        let mut b = req(20, 20);
        b.preset = Some(px(60));
        // Surpluses 50 and 40 share an excess of 30.
        let widths = negotiate(&[a, b], px(90), None);
        assert_near(widths.iter().copied().sum::<Px>(), 90_000);
        assert_near(widths[0] - px(10), 33_333);
        assert_near(widths[1] - px(20), 26_667);
    }

    #[test]
    fn overflow_leaves_columns_at_their_minimum_alone() {
        let mut a = req(0, 0);
        a.preset = Some(px(40));
        let mut b = req(30, 30);
        b.preset = Some(px(50));
        let c = req(50, 50);
        // Surpluses 40, 20 and 0 share an excess of 40.
        let widths = negotiate(&[a, b, c], px(100), None);
        assert_near(widths[0], 13_333);
        assert_near(widths[1], 36_667);
        assert_eq!(widths[2], px(50));
        assert_near(widths.iter().copied().sum::<Px>(), 100_000);
    }

    #[test]
    fn minimums_are_never_shrunk() {
        let widths = negotiate(&[req(80, 80), req(80, 80)], px(100), None);
        assert_eq!(widths, vec![px(80), px(80)]);
        assert_eq!(overhead(2, px(3), px(1)), px(11));
    }
}
