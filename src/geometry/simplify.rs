//! Ramer-Douglas-Peucker track simplification.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::TrackStore;
use crate::types::{PointId, Track};

/// Planar distance from `p` to the line through `a` and `b`.
///
/// Points are `(longitude, latitude)` pairs in degrees. A degenerate line
/// falls back to the distance from `a`.
fn line_distance(p: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
    let (x, y) = p;
    let (x1, y1) = a;
    let (x2, y2) = b;

    let dy = y1 - y2;
    let dx = x1 - x2;
    let norm = dx.hypot(dy);
    if norm == 0.0 {
        return (x - x1).hypot(y - y1);
    }
    let c = x1 * y2 - x2 * y1;
    (dy * x - dx * y + c).abs() / norm
}

/// Indices of the points kept by Douglas-Peucker with `tolerance`.
///
/// Points are `(longitude, latitude)`. The first and last points are always
/// kept; tracks of two points or fewer are returned whole. The returned
/// indices are ascending.
pub fn douglas_peucker(points: &[(f64, f64)], tolerance: f64) -> Vec<usize> {
    let n = points.len();
    if n <= 2 {
        return (0..n).collect();
    }

    let mut keep = vec![false; n];
    keep[0] = true;
    keep[n - 1] = true;

    // Explicit stack instead of recursion: day-long tracks can be deep
    let mut stack = vec![(0, n - 1)];
    while let Some((first, last)) = stack.pop() {
        if last <= first + 1 {
            continue;
        }
        let (a, b) = (points[first], points[last]);
        let (index, max_dist) = (first + 1..last)
            .map(|i| (i, line_distance(points[i], a, b)))
            .fold((first, 0.0_f64), |best, cur| if cur.1 > best.1 { cur } else { best });

        if index != first && max_dist >= tolerance {
            keep[index] = true;
            stack.push((first, index));
            stack.push((index, last));
        }
    }

    keep.iter()
        .enumerate()
        .filter_map(|(i, &k)| k.then_some(i))
        .collect()
}

/// Ids of the track points that survive simplification.
pub fn simplify_track(track: &Track, tolerance: f64) -> Vec<PointId> {
    let coords: Vec<(f64, f64)> = track
        .points
        .iter()
        .map(|p| (p.longitude, p.latitude))
        .collect();
    douglas_peucker(&coords, tolerance)
        .into_iter()
        .map(|i| track.points[i].id)
        .collect()
}

/// Outcome of one simplification pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimplifyReport {
    pub tracks: usize,
    pub points: usize,
    pub deleted: usize,
    /// Deletions that failed and were skipped.
    pub failed: usize,
}

/// Periodic job thinning recently stored tracks.
pub struct GeometrySimplifier {
    store: Arc<dyn TrackStore>,
    tolerance: f64,
    lookback: Duration,
}

impl GeometrySimplifier {
    pub fn new(store: Arc<dyn TrackStore>, tolerance: f64, lookback: Duration) -> Self {
        Self {
            store,
            tolerance,
            lookback,
        }
    }

    /// Simplify every track received within the look-back window and delete
    /// the points that were dropped.
    pub async fn run(&self) -> Result<SimplifyReport> {
        let end = Utc::now();
        let lookback = chrono::Duration::from_std(self.lookback)
            .map_err(|e| Error::InvalidConfig(format!("lookback out of range: {e}")))?;
        let start = end - lookback;

        info!(%start, %end, tolerance = self.tolerance, "Simplifying tracks");
        let tracks = self.store.list_tracks_in_window(None, start, end).await?;

        let mut report = SimplifyReport::default();
        for track in &tracks {
            report.tracks += 1;
            report.points += track.points.len();

            let kept: HashSet<PointId> = simplify_track(track, self.tolerance).into_iter().collect();
            for point in track.points.iter().filter(|p| !kept.contains(&p.id)) {
                match self.store.delete_point(point.id).await {
                    Ok(()) => report.deleted += 1,
                    Err(e) => {
                        report.failed += 1;
                        warn!(point = %point.id, error = %e, "Failed to delete point");
                    }
                }
            }
            debug!(
                vehicle = %track.vehicle_id,
                points = track.points.len(),
                kept = kept.len(),
                "Track simplified"
            );
        }

        info!(
            tracks = report.tracks,
            deleted = report.deleted,
            failed = report.failed,
            "Track simplification finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Position, DEFAULT_TOLERANCE};
    use crate::store::MemoryStore;
    use crate::types::VehicleId;

    #[test]
    fn test_short_tracks_unchanged() {
        assert!(douglas_peucker(&[], DEFAULT_TOLERANCE).is_empty());
        assert_eq!(douglas_peucker(&[(1.0, 1.0)], DEFAULT_TOLERANCE), vec![0]);
        assert_eq!(
            douglas_peucker(&[(1.0, 1.0), (1.0, 1.0)], DEFAULT_TOLERANCE),
            vec![0, 1]
        );
    }

    #[test]
    fn test_collinear_points_collapse() {
        let line: Vec<_> = (0..10).map(|i| (f64::from(i) * 0.001, 55.0)).collect();
        assert_eq!(douglas_peucker(&line, DEFAULT_TOLERANCE), vec![0, 9]);
    }

    #[test]
    fn test_corner_is_kept() {
        let pts = [
            (37.0, 55.0),
            (37.001, 55.0),
            (37.002, 55.0),
            (37.002, 55.001),
            (37.002, 55.002),
        ];
        assert_eq!(douglas_peucker(&pts, DEFAULT_TOLERANCE), vec![0, 2, 4]);
    }

    #[test]
    fn test_small_wobble_dropped_large_kept() {
        let pts = [
            (0.0, 0.0),
            (0.001, 0.000_05),
            (0.002, 0.0),
            (0.003, 0.0005),
            (0.004, 0.0),
        ];
        assert_eq!(douglas_peucker(&pts, DEFAULT_TOLERANCE), vec![0, 2, 3, 4]);
    }

    #[test]
    fn test_distance_at_tolerance_is_kept() {
        let pts = [(0.0, 0.0), (1.0, 0.5), (2.0, 0.0)];
        assert_eq!(douglas_peucker(&pts, 0.5), vec![0, 1, 2]);
        assert_eq!(douglas_peucker(&pts, 0.500_001), vec![0, 2]);
    }

    #[test]
    fn test_closed_loop_keeps_far_point() {
        let pts = [(0.0, 0.0), (0.01, 0.0), (0.01, 0.01), (0.0, 0.0)];
        let kept = douglas_peucker(&pts, DEFAULT_TOLERANCE);
        assert!(kept.contains(&2));
    }

    #[test]
    fn test_idempotent() {
        let pts: Vec<(f64, f64)> = (0..200)
            .map(|i| {
                let t = f64::from(i) * 0.0005;
                (37.0 + t, 55.0 + (t * 40.0).sin() * 0.001)
            })
            .collect();
        let first = douglas_peucker(&pts, DEFAULT_TOLERANCE);
        let simplified: Vec<_> = first.iter().map(|&i| pts[i]).collect();
        let second = douglas_peucker(&simplified, DEFAULT_TOLERANCE);
        assert_eq!(second, (0..simplified.len()).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_job_deletes_dropped_points() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let mut ids = Vec::new();
        for i in 0..5 {
            let t = now - chrono::Duration::minutes(10 - i);
            let pos = Position::new(55.0, 37.0 + f64::from(i as i32) * 0.001, None);
            ids.push(store.insert_point(VehicleId(1), pos, t, t));
        }
        // outside the look-back window
        let old = now - chrono::Duration::days(2);
        let stale = store.insert_point(VehicleId(1), Position::new(56.0, 38.0, None), old, old);

        let job = GeometrySimplifier::new(store.clone(), DEFAULT_TOLERANCE, Duration::from_secs(86_400));
        let report = job.run().await.unwrap();

        assert_eq!(report.tracks, 1);
        assert_eq!(report.points, 5);
        assert_eq!(report.deleted, 3);
        let remaining: Vec<_> = store.points().into_iter().map(|p| p.id).collect();
        assert_eq!(remaining, vec![ids[0], ids[4], stale]);
    }
}
