//! Position sources for mobile nodes.
//!
//! A node asks its source for a new position once per tick. Sources are
//! injected, so callers can replay recorded traces or scripted paths.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::types::{Area, Point};

pub trait PositionSource {
    /// Advance by `dt_secs` seconds and return the new position.
    fn advance(&mut self, dt_secs: f64) -> Point;

    fn position(&self) -> Point;
}

/// Random waypoint: walk straight to a random destination at a random speed,
/// pause for a random time, repeat.
pub struct RandomWaypoint {
    area: Area,
    position: Point,
    destination: Option<Point>,
    speed_mps: f64,
    pause_remaining_secs: f64,
    speed_range: (f64, f64),
    pause_range: (f64, f64),
    rng: StdRng,
}

impl RandomWaypoint {
    pub fn new(area: Area, start: Point, seed: u64) -> Self {
        Self::with_ranges(area, start, (0.5, 2.0), (0.0, 10.0), seed)
    }

    pub fn with_ranges(area: Area, start: Point, speed_range: (f64, f64), pause_range: (f64, f64), seed: u64) -> Self {
        let mut model = Self {
            area,
            position: area.clamp(start),
            destination: None,
            speed_mps: 0.0,
            pause_remaining_secs: 0.0,
            speed_range,
            pause_range,
            rng: StdRng::seed_from_u64(seed),
        };
        model.choose_destination();
        model
    }

    fn uniform(&mut self, (low, high): (f64, f64)) -> f64 {
        if high > low { self.rng.gen_range(low..=high) } else { low }
    }

    fn choose_destination(&mut self) {
        let x = self.uniform((0.0, self.area.width));
        let y = self.uniform((0.0, self.area.height));
        self.destination = Some(Point::new(x, y));
        self.speed_mps = self.uniform(self.speed_range);
    }
}

impl PositionSource for RandomWaypoint {
    fn advance(&mut self, dt_secs: f64) -> Point {
        if self.pause_remaining_secs > 0.0 {
            self.pause_remaining_secs -= dt_secs;
            return self.position;
        }
        let Some(destination) = self.destination else {
            self.choose_destination();
            return self.position;
        };

        let distance = self.position.distance_to(&destination);
        let step = self.speed_mps * dt_secs;
        if step >= distance {
            self.position = destination;
            self.destination = None;
            self.pause_remaining_secs = self.uniform(self.pause_range);
        } else {
            let ratio = step / distance;
            self.position = self.position.offset((destination.x - self.position.x) * ratio, (destination.y - self.position.y) * ratio);
        }
        self.position
    }

    fn position(&self) -> Point {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moves_at_bounded_speed_and_stays_in_area() {
        let area = Area { width: 200.0, height: 100.0 };
        let mut model = RandomWaypoint::new(area, Point::new(50.0, 50.0), 11);
        let mut previous = model.position();
        for _ in 0..2000 {
            let next = model.advance(1.0);
            assert!(previous.distance_to(&next) <= 2.0 + 1e-9);
            assert!(area.contains(&next));
            previous = next;
        }
    }

    #[test]
    fn pauses_after_reaching_destination() {
        let area = Area { width: 10.0, height: 10.0 };
        // Fast walker with a fixed 5 s pause
        let mut model = RandomWaypoint::with_ranges(area, Point::new(0.0, 0.0), (100.0, 100.0), (5.0, 5.0), 3);
        let arrived = model.advance(1.0);
        for _ in 0..5 {
            assert_eq!(model.advance(1.0), arrived);
        }
    }
}
