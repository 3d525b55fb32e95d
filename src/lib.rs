//! Integration of first-order ordinary differential equation systems with a dynamically
//! adjusted time step.
//!
//! Rather than estimating truncation error with an embedded pair, the step size controller
//! here watches a single *monitored* component of the state vector: whenever one step would
//! change that component by more than a caller-chosen relative fraction, the step is rejected
//! and the step size halved (down to a floor), and after enough simulated time has passed the
//! step size is doubled back toward its nominal value. This makes the controller cheap and
//! predictable, and well suited to simulations where one state variable (a position, a mass,
//! a concentration) is known to dominate the accuracy requirements.
//!
//! Two explicit schemes are available per step: first-order Euler (one derivative evaluation)
//! and a staged fourth-order Runge-Kutta variant (four evaluations). The derivative callback
//! receives the (sub)step size in use rather than an abscissa, so only time-independent
//! right-hand sides are expressible directly; augment the state vector with a time variable
//! if the system needs one.
//!
//! Integration runs until a caller-supplied end condition fires, the simulated time budget is
//! exhausted, or the step size floor is reached while the monitored component still changes
//! too fast. The three outcomes are distinguished by [`Status`], and the accumulated
//! trajectory is returned in all of them.
//!
//! As an example, consider exponential decay `dy/dt = -2y` starting from `y = 3`, stopping
//! once the solution drops below `0.1`:
//!
//! ```
//! // Define the ODE.
//! struct Decay {
//!     rate: f64,
//! }
//!
//! impl dynstep::System for Decay {
//!     type Float = f64;
//!
//!     fn derivative(
//!         &self,
//!         _step_size: f64,
//!         y: dynstep::ArrayView1<f64>,
//!         mut dydt: dynstep::ArrayViewMut1<f64>,
//!     ) {
//!         dydt[0] = -self.rate * y[0];
//!     }
//! }
//!
//! let system = Decay { rate: 2.0 };
//!
//! // Nominal step 0.5, floor 0.01, monitoring component 0 with at most 10% change per step.
//! let integrator = dynstep::Integrator::new(0.5, 0.01, 0, 0.1).unwrap();
//!
//! let solution = integrator
//!     .integrate(
//!         &system,
//!         0.,
//!         2.,
//!         ndarray::array![3.].view(),
//!         |_time: f64, y: dynstep::ArrayView1<f64>, _y_prev: dynstep::ArrayView1<f64>| {
//!             if y[0] < 0.1 { 1 } else { 0 }
//!         },
//!     )
//!     .unwrap();
//!
//! assert_eq!(solution.status, dynstep::Status::EndConditionMet(1));
//! assert!(solution.status.code() > 0);
//! assert!(solution.final_state()[0] < 0.1);
//! assert!(solution.times.windows(2).all(|w| w[1] > w[0]));
//! ```

pub use nd::ArrayView1;
pub use nd::ArrayViewMut1;
use ndarray as nd;
use num_traits::cast;

pub trait Float:
    num_traits::Float
    + core::ops::AddAssign
    + core::ops::DivAssign
    + core::fmt::Debug
    + nd::ScalarOperand
{
}

impl Float for f32 {}
impl Float for f64 {}

/// Trait for defining an ordinary differential equation system.
pub trait System {
    /// The floating point type.
    type Float: Float;

    /// Evaluate the time derivatives at state `y` and store them in `dydt`.
    ///
    /// `step_size` is the (sub)step size the integrator is about to apply, not an abscissa;
    /// under the fourth-order scheme the half-step stages receive half the current step size.
    /// `dydt` has the same length as `y`.
    fn derivative(
        &self,
        step_size: Self::Float,
        y: ArrayView1<Self::Float>,
        dydt: ArrayViewMut1<Self::Float>,
    );
}

/// Trait for deciding when integration should stop early.
///
/// Evaluated once at the top of every loop iteration (including iterations whose step is later
/// rejected) with the current time, the current state, and the state seen at the previous
/// evaluation. On the first evaluation `y_prev` is all zeros. Return `0` to continue; any
/// nonzero value stops integration, and its absolute value is surfaced in
/// [`Status::EndConditionMet`].
///
/// Any `FnMut(F, ArrayView1<F>, ArrayView1<F>) -> i32` closure implements this trait.
pub trait EndCondition<F: Float> {
    fn end_condition(&mut self, time: F, y: ArrayView1<F>, y_prev: ArrayView1<F>) -> i32;
}

impl<F: Float, T> EndCondition<F> for T
where
    T: FnMut(F, ArrayView1<F>, ArrayView1<F>) -> i32,
{
    fn end_condition(&mut self, time: F, y: ArrayView1<F>, y_prev: ArrayView1<F>) -> i32 {
        self(time, y, y_prev)
    }
}

/// The integration scheme applied to each attempted step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Scheme {
    /// First-order explicit Euler: one derivative evaluation per attempted step.
    Euler,
    /// Staged fourth-order Runge-Kutta: four weighted derivative evaluations per attempted
    /// step. See [`Integrator::integrate`] for the exact stage layout.
    #[default]
    RungeKutta4,
}

/// Validation errors raised before any integration work happens.
///
/// Runtime outcomes (step size exhaustion, time budget exhaustion, end condition) are not
/// errors; they are reported through [`Status`] together with the trajectory accumulated so
/// far.
#[derive(Debug, Clone)]
pub enum Error<F: Float> {
    NonPositiveBaseStep(F),
    NonPositiveMinStep(F),
    MinStepExceedsBaseStep { min_step: F, base_step: F },
    NonPositiveMaxRelativeDelta(F),
    EmptyInitialState,
    MonitoredIndexOutOfBounds { index: usize, len: usize },
}

impl<F: Float> std::fmt::Display for Error<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NonPositiveBaseStep(v) => {
                write!(f, "base_step must be positive and finite (got {:?})", v)
            }
            Error::NonPositiveMinStep(v) => {
                write!(f, "min_step must be positive and finite (got {:?})", v)
            }
            Error::MinStepExceedsBaseStep { min_step, base_step } => {
                write!(
                    f,
                    "min_step must not exceed base_step (got min_step {:?}, base_step {:?})",
                    min_step, base_step
                )
            }
            Error::NonPositiveMaxRelativeDelta(v) => {
                write!(f, "max_relative_delta must be positive (got {:?})", v)
            }
            Error::EmptyInitialState => {
                write!(f, "initial state must contain at least one component")
            }
            Error::MonitoredIndexOutOfBounds { index, len } => {
                write!(
                    f,
                    "monitored index {} is out of bounds for a state vector of length {}",
                    index, len
                )
            }
        }
    }
}

impl<F: Float> std::error::Error for Error<F> {}

/// How an integration run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The monitored component still changed by more than the allowed fraction at the minimum
    /// step size. The trajectory stops growing at the point of failure.
    StepSizeExhausted,
    /// `max_time` was reached without the end condition firing. Not a failure; the trajectory
    /// covers the whole time budget.
    MaxTimeReached,
    /// The end condition returned a nonzero signal; its absolute value is carried here.
    EndConditionMet(i32),
}

impl Status {
    /// The conventional integer form: `-1` for [`Status::StepSizeExhausted`], `0` for
    /// [`Status::MaxTimeReached`], and the (positive) end condition signal otherwise.
    pub fn code(&self) -> i32 {
        match self {
            Status::StepSizeExhausted => -1,
            Status::MaxTimeReached => 0,
            Status::EndConditionMet(signal) => *signal,
        }
    }
}

/// Counters describing how much work an integration run performed.
#[derive(Clone, Debug)]
pub struct Stats {
    /// Number of derivative evaluations (four per attempted step under
    /// [`Scheme::RungeKutta4`], one under [`Scheme::Euler`]).
    pub num_derivative_evals: usize,
    /// Number of accepted steps; equals the number of trajectory points after the first.
    pub num_accepted_steps: usize,
    /// Number of rejected steps (attempts that only shrank the step size).
    pub num_rejected_steps: usize,
}

/// The trajectory and outcome of one integration run.
#[derive(Clone, Debug)]
pub struct Solution<F: Float> {
    /// Strictly increasing times, starting at `start_time`.
    pub times: Vec<F>,
    /// State vectors corresponding one-to-one with `times`.
    pub states: Vec<nd::Array1<F>>,
    /// How the run ended.
    pub status: Status,
    /// The step size in effect when the run ended; useful as a starting point when resuming
    /// with adjusted parameters.
    pub final_step_size: F,
    /// Work counters.
    pub stats: Stats,
}

impl<F: Float> Solution<F> {
    /// The last time reached. The trajectory is seeded with the initial point, so it is never
    /// empty.
    pub fn final_time(&self) -> F {
        *self.times.last().unwrap()
    }

    /// The state at [`Self::final_time`].
    pub fn final_state(&self) -> ArrayView1<'_, F> {
        self.states.last().unwrap().view()
    }
}

/// An ODE integrator whose step size is gated by the relative per-step change of a single
/// monitored state component.
///
/// The step size always lies in `[min_step, base_step]`. A step whose monitored change
/// exceeds `max_relative_delta` is rejected and the step size halved (floored at `min_step`);
/// a rejection also schedules a *relaxation* one `base_step` of simulated time ahead, at
/// which point the step size is doubled once (capped at `base_step`). Rejecting while already
/// at the floor ends the run with [`Status::StepSizeExhausted`].
#[derive(Clone, Debug)]
pub struct Integrator<F: Float> {
    /// The nominal step size the controller relaxes toward.
    base_step: F,
    /// The smallest step size to try before giving up.
    min_step: F,
    /// Index of the state component whose relative change gates acceptance.
    monitored_index: usize,
    /// Largest tolerated relative change of the monitored component per step, as a fraction
    /// (`0.01` tolerates 1%).
    max_relative_delta: F,
    /// The per-step integration scheme.
    scheme: Scheme,
}

impl<F: Float> Integrator<F> {
    /// Create an integrator, validating the step-control parameters.
    ///
    /// `monitored_index` is checked against the state length at
    /// [`integrate`](Self::integrate) time. The scheme defaults to [`Scheme::RungeKutta4`];
    /// see [`with_scheme`](Self::with_scheme).
    pub fn new(
        base_step: F,
        min_step: F,
        monitored_index: usize,
        max_relative_delta: F,
    ) -> Result<Self, Error<F>> {
        if !(base_step > F::zero()) || !base_step.is_finite() {
            return Err(Error::NonPositiveBaseStep(base_step));
        }
        if !(min_step > F::zero()) || !min_step.is_finite() {
            return Err(Error::NonPositiveMinStep(min_step));
        }
        if min_step > base_step {
            return Err(Error::MinStepExceedsBaseStep { min_step, base_step });
        }
        if !(max_relative_delta > F::zero()) {
            return Err(Error::NonPositiveMaxRelativeDelta(max_relative_delta));
        }
        Ok(Self {
            base_step,
            min_step,
            monitored_index,
            max_relative_delta,
            scheme: Scheme::default(),
        })
    }

    /// Select the per-step integration scheme.
    pub fn with_scheme(self, scheme: Scheme) -> Self {
        Self { scheme, ..self }
    }

    /// Integrate `system` from `(start_time, initial_state)` until `end_condition` fires,
    /// `max_time` is reached, or the step size floor is exhausted.
    ///
    /// # Arguments
    ///
    /// * `system`: The ODE system.
    /// * `start_time`: The simulated time of `initial_state`.
    /// * `max_time`: The simulated time budget. If `max_time <= start_time` the run performs
    ///   zero steps and returns [`Status::MaxTimeReached`] with only the initial point.
    /// * `initial_state`: The state vector at `start_time`; its length fixes the state length
    ///   for the whole run.
    /// * `end_condition`: Early-stop predicate, see [`EndCondition`].
    ///
    /// # Result
    ///
    /// The accumulated trajectory with its [`Status`] and work counters, or an [`Error`] if
    /// `initial_state` is empty or the monitored index is out of bounds. All numeric
    /// outcomes, including step size exhaustion, come back as `Ok`.
    ///
    /// # Scheme
    ///
    /// Under [`Scheme::RungeKutta4`] each attempted step of size `h` evaluates
    ///
    /// ```text
    /// k1 = f(h,   y)
    /// k2 = f(h/2, y + k1*h/2)
    /// k3 = f(h/2, y + k2*h/2)
    /// k4 = f(h,   y + k3*h)
    /// ```
    ///
    /// and advances by `h * (k1 + 2*k2 + 2*k3 + k4) / 6`. The derivative always receives a
    /// step size, never an abscissa, so the scheme is fourth-order only for time-independent
    /// systems.
    ///
    /// # Sharp edges
    ///
    /// The acceptance test divides the monitored component's absolute change by the *new*
    /// monitored value, falling back to the current value only when the new one is exactly
    /// zero:
    ///
    /// * when both are exactly zero the step is accepted unconditionally, whatever the rest
    ///   of the state did;
    /// * the denominator keeps its sign, so a step that drives the monitored component
    ///   negative (or that starts from a negative value) yields a negative ratio and is
    ///   accepted;
    /// * non-finite values produced by the system are not screened: a NaN monitored value
    ///   compares false against the threshold and the step is accepted.
    ///
    /// These behaviors are deliberate and kept stable; callers monitoring a component that
    /// crosses or sits at zero should account for them.
    pub fn integrate<S, E>(
        &self,
        system: &S,
        start_time: F,
        max_time: F,
        initial_state: ArrayView1<F>,
        mut end_condition: E,
    ) -> Result<Solution<F>, Error<F>>
    where
        S: System<Float = F>,
        E: EndCondition<F>,
    {
        if initial_state.is_empty() {
            return Err(Error::EmptyInitialState);
        }
        if self.monitored_index >= initial_state.len() {
            return Err(Error::MonitoredIndexOutOfBounds {
                index: self.monitored_index,
                len: initial_state.len(),
            });
        }

        let mut system = DerivativeCounter {
            system,
            num_derivative_evals: 0,
        };

        // Advisory reservation only; clamped so a pathological time budget cannot trigger a
        // pathological allocation.
        let estimated_points = cast::<F, usize>((max_time - start_time) / self.base_step)
            .unwrap_or(0)
            .saturating_add(1)
            .min(1 << 20);
        let mut times = Vec::with_capacity(estimated_points);
        let mut states = Vec::with_capacity(estimated_points);

        let mut y_cur = initial_state.to_owned();
        let mut y_prev = nd::Array1::zeros(y_cur.raw_dim());

        // Scratch for stage evaluations, reused every iteration. `slope` holds k1 and then
        // the combined increment per unit step.
        let mut slope = nd::Array1::zeros(y_cur.raw_dim());
        let mut stage = nd::Array1::zeros(y_cur.raw_dim());
        let mut k2 = nd::Array1::zeros(y_cur.raw_dim());
        let mut k3 = nd::Array1::zeros(y_cur.raw_dim());
        let mut k4 = nd::Array1::zeros(y_cur.raw_dim());
        let mut y_new = nd::Array1::zeros(y_cur.raw_dim());

        let two: F = cast(2).unwrap();
        let six: F = cast(6).unwrap();

        let mut current_time = start_time;
        let mut step_size = self.base_step;
        let mut next_relax: Option<F> = None;
        let mut num_accepted_steps = 0;
        let mut num_rejected_steps = 0;

        times.push(current_time);
        states.push(y_cur.clone());

        let status = loop {
            if current_time >= max_time {
                break Status::MaxTimeReached;
            }

            let signal = end_condition.end_condition(current_time, y_cur.view(), y_prev.view());
            y_prev.assign(&y_cur);
            if signal != 0 {
                break Status::EndConditionMet(signal.abs());
            }

            // A previously shrunk step doubles back toward the nominal size once its
            // scheduled relaxation time has passed.
            if step_size < self.base_step
                && next_relax.is_some_and(|relax_time| current_time >= relax_time)
            {
                step_size = (step_size * two).min(self.base_step);
                next_relax = None;
            }

            let monitor_cur = y_cur[self.monitored_index];

            match self.scheme {
                Scheme::Euler => {
                    system.derivative(step_size, y_cur.view(), slope.view_mut());
                }
                Scheme::RungeKutta4 => {
                    let half_step = step_size / two;

                    system.derivative(step_size, y_cur.view(), slope.view_mut());

                    stage.assign(&y_cur);
                    stage.scaled_add(half_step, &slope);
                    system.derivative(half_step, stage.view(), k2.view_mut());

                    stage.assign(&y_cur);
                    stage.scaled_add(half_step, &k2);
                    system.derivative(half_step, stage.view(), k3.view_mut());

                    stage.assign(&y_cur);
                    stage.scaled_add(step_size, &k3);
                    system.derivative(step_size, stage.view(), k4.view_mut());

                    slope.scaled_add(two, &k2);
                    slope.scaled_add(two, &k3);
                    slope += &k4;
                    slope /= six;
                }
            }

            y_new.assign(&y_cur);
            y_new.scaled_add(step_size, &slope);

            let monitor_new = y_new[self.monitored_index];
            let denominator = if monitor_new != F::zero() {
                monitor_new
            } else {
                monitor_cur
            };

            if denominator != F::zero()
                && (monitor_new - monitor_cur).abs() / denominator > self.max_relative_delta
            {
                num_rejected_steps += 1;

                // Exact comparison is sound: the floor below assigns `min_step` verbatim.
                if step_size == self.min_step {
                    break Status::StepSizeExhausted;
                }
                step_size = (step_size / two).max(self.min_step);
                if next_relax.is_none() {
                    next_relax = Some(current_time + self.base_step);
                }
            } else {
                num_accepted_steps += 1;
                current_time += step_size;
                times.push(current_time);
                states.push(y_new.clone());
                y_cur.assign(&y_new);
            }
        };

        Ok(Solution {
            times,
            states,
            status,
            final_step_size: step_size,
            stats: Stats {
                num_derivative_evals: system.num_derivative_evals,
                num_accepted_steps,
                num_rejected_steps,
            },
        })
    }
}

struct DerivativeCounter<'a, S: System> {
    system: &'a S,
    num_derivative_evals: usize,
}

impl<S: System> DerivativeCounter<'_, S> {
    fn derivative(
        &mut self,
        step_size: S::Float,
        y: ArrayView1<S::Float>,
        dydt: ArrayViewMut1<S::Float>,
    ) {
        self.num_derivative_evals += 1;
        self.system.derivative(step_size, y, dydt);
    }
}
