pub mod kalman;

pub use kalman::{KalmanPositionFilter, KalmanState};
