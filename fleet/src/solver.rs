//! Stronghold prediction from eye-of-ender throws
//!
//! The session forwards `pos` and `pearl` chat commands here. Each pearl throw
//! is a ray from the throw position along the player's yaw; two non-parallel
//! rays pin the stronghold at their intersection.

use std::fmt;

const PARALLEL_EPSILON: f64 = 1e-9;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SolveError {
    #[error("expected {expected} numbers, got '{payload}'")]
    Arity { expected: usize, payload: String },
    #[error("invalid number '{0}'")]
    Number(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub x: f64,
    pub z: f64,
    /// Distance from the last reported player position, if any
    pub distance: Option<f64>,
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x={:.0} z={:.0}", self.x, self.z)?;
        if let Some(distance) = self.distance {
            write!(f, " ({:.0} blocks away)", distance)?;
        }
        Ok(())
    }
}

/// Receives position and throw observations for one replica's world
pub trait CoordinateSolver: Send {
    fn observe_position(&mut self, payload: &str) -> Result<Option<Prediction>, SolveError>;
    fn observe_throw(&mut self, payload: &str) -> Result<Option<Prediction>, SolveError>;
    /// Forgets everything; called when the world is thrown away
    fn reset(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Throw {
    x: f64,
    z: f64,
    yaw: f64,
}

impl Throw {
    // Minecraft yaw: 0 faces +z, 90 faces -x
    fn direction(&self) -> (f64, f64) {
        let radians = self.yaw.to_radians();
        (-radians.sin(), radians.cos())
    }
}

#[derive(Debug, Default)]
pub struct Triangulator {
    throws: Vec<Throw>,
    position: Option<(f64, f64)>,
}

impl Triangulator {
    pub fn new() -> Self {
        Self::default()
    }

    fn prediction(&self) -> Option<Prediction> {
        let [.., first, second] = self.throws.as_slice() else {
            return None;
        };
        let (x, z) = intersect(first, second)?;
        let distance = self
            .position
            .map(|(px, pz)| ((x - px).powi(2) + (z - pz).powi(2)).sqrt());
        Some(Prediction { x, z, distance })
    }
}

impl CoordinateSolver for Triangulator {
    fn observe_position(&mut self, payload: &str) -> Result<Option<Prediction>, SolveError> {
        let [x, z] = parse_numbers::<2>(payload)?;
        self.position = Some((x, z));
        Ok(self.prediction())
    }

    fn observe_throw(&mut self, payload: &str) -> Result<Option<Prediction>, SolveError> {
        let [x, z, yaw] = parse_numbers::<3>(payload)?;
        self.throws.push(Throw { x, z, yaw });
        self.position = Some((x, z));
        Ok(self.prediction())
    }

    fn reset(&mut self) {
        self.throws.clear();
        self.position = None;
    }
}

fn parse_numbers<const N: usize>(payload: &str) -> Result<[f64; N], SolveError> {
    let words: Vec<&str> = payload.split_whitespace().collect();
    if words.len() != N {
        return Err(SolveError::Arity {
            expected: N,
            payload: payload.to_string(),
        });
    }

    let mut numbers = [0.0; N];
    for (slot, word) in numbers.iter_mut().zip(words) {
        *slot = word
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite())
            .ok_or_else(|| SolveError::Number(word.to_string()))?;
    }
    Ok(numbers)
}

/// Intersects two throw rays; `None` when they are parallel or meet behind
/// either thrower
fn intersect(a: &Throw, b: &Throw) -> Option<(f64, f64)> {
    let (adx, adz) = a.direction();
    let (bdx, bdz) = b.direction();

    let cross = adx * bdz - adz * bdx;
    if cross.abs() < PARALLEL_EPSILON {
        return None;
    }

    let (wx, wz) = (b.x - a.x, b.z - a.z);
    let t = (wx * bdz - wz * bdx) / cross;
    let s = (wx * adz - wz * adx) / cross;
    if t < 0.0 || s < 0.0 {
        return None;
    }

    Some((a.x + t * adx, a.z + t * adz))
}
