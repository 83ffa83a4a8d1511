use std::cell::Cell;

use rand::rngs::StdRng;
use rand::Rng;

/// The parameters of a car-following model.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ModelParams {
    /// The vehicle's maximum acceleration in m/s^2.
    pub max_accel: f64,
    /// The vehicle's maximum comfortable deceleration, a positive number in m/s^2.
    pub max_decel: f64,
    /// The deceleration available as a last resort, a positive number in m/s^2.
    pub emergency_decel: f64,
    /// The minimum standstill gap to the vehicle ahead in m.
    pub min_gap: f64,
    /// The desired time headway to the vehicle ahead in s.
    pub headway: f64,
    /// The driver imperfection; 0 for no dawdling, 1 for maximum.
    pub imperfection: f64,
}

/// A car-following model, selected per vehicle at construction.
///
/// All variants honour the same contract: the speed returned by
/// [`follow_speed`](CarFollowModel::follow_speed) allows the vehicle to stop
/// behind its leader even if the leader brakes at its maximum deceleration.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CarFollowModel {
    /// The Krauss safe-speed model.
    Krauss(ModelParams),
    /// The intelligent driver model, clipped to the Krauss safe speed.
    Idm(ModelParams),
}

/// Per-tick speed plan of a vehicle.
///
/// Constraints are accumulated as an upper speed bound during the evaluation
/// phase, then resolved into the next velocity during the commit phase.
#[derive(Clone, Debug, Default)]
pub struct SpeedPlan {
    /// The candidate next velocity; constraints only lower it.
    v_next: Cell<f64>,
    /// Whether exceeding the comfortable deceleration is expected
    /// (external forced stop), suppressing the near-miss diagnostic.
    forced: Cell<bool>,
}

/// The outcome of resolving a [SpeedPlan].
pub struct ResolvedSpeed {
    /// The velocity for the next tick in m/s.
    pub vel: f64,
    /// Whether the comfortable deceleration had to be exceeded.
    pub emergency: bool,
}

impl CarFollowModel {
    pub fn params(&self) -> &ModelParams {
        match self {
            CarFollowModel::Krauss(p) => p,
            CarFollowModel::Idm(p) => p,
        }
    }

    /// Computes the vehicle's safe speed behind a moving leader.
    ///
    /// `gap` is the net bumper-to-bumper distance in m; negative values are
    /// clamped to zero since they can occur transiently during lateral
    /// negotiation. `leader_decel` is the leader's maximum deceleration.
    pub fn follow_speed(&self, vel: f64, gap: f64, leader_vel: f64, leader_decel: f64, dt: f64) -> f64 {
        let p = self.params();
        let v_safe = p.safe_speed(gap, leader_vel, leader_decel);
        match self {
            CarFollowModel::Krauss(_) => v_safe,
            CarFollowModel::Idm(p) => {
                let acc = p.idm_accel(vel, gap, leader_vel);
                f64::min(f64::max(vel + acc * dt, 0.0), v_safe)
            }
        }
    }

    /// Computes the vehicle's safe speed when approaching a non-moving
    /// obstacle such as a stop line or a junction wait position.
    pub fn stop_speed(&self, vel: f64, gap: f64, dt: f64) -> f64 {
        let p = self.params();
        self.follow_speed(vel, gap, 0.0, p.max_decel, dt)
    }

    /// The minimum bumper-to-bumper gap at which the vehicle can travel at
    /// `vel` behind a leader at `leader_vel` without violating the safe-speed
    /// contract. Used for lane-change gap acceptance.
    pub fn secure_gap(&self, vel: f64, leader_vel: f64, leader_decel: f64) -> f64 {
        let p = self.params();
        let own = vel * p.headway + vel.powi(2) / (2.0 * p.max_decel);
        let theirs = leader_vel.powi(2) / (2.0 * leader_decel);
        p.min_gap + f64::max(own - theirs, 0.0)
    }
}

impl ModelParams {
    /// Validates the parameters. Out-of-range values are a caller error,
    /// rejected at vehicle construction rather than clamped later.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.max_accel > 0.0, "max_accel must be positive");
        anyhow::ensure!(self.max_decel > 0.0, "max_decel must be positive");
        anyhow::ensure!(
            self.emergency_decel >= self.max_decel,
            "emergency_decel must not be below max_decel"
        );
        anyhow::ensure!(self.min_gap >= 0.0, "min_gap must not be negative");
        anyhow::ensure!(self.headway >= 0.0, "headway must not be negative");
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.imperfection),
            "imperfection must be within [0, 1]"
        );
        Ok(())
    }

    /// The Krauss safe speed: the largest `v` satisfying
    /// `v * headway + v^2 / (2 * decel) <= gap_eff + leader_vel^2 / (2 * leader_decel)`.
    fn safe_speed(&self, gap: f64, leader_vel: f64, leader_decel: f64) -> f64 {
        let gap_eff = f64::max(gap - self.min_gap, 0.0);
        let tau_b = self.max_decel * self.headway;
        let discr =
            tau_b.powi(2) + 2.0 * self.max_decel * gap_eff + leader_vel.powi(2) * (self.max_decel / leader_decel);
        f64::max(discr.sqrt() - tau_b, 0.0)
    }

    /// The interaction term of the intelligent driver model. The free-road
    /// term is handled by the speed limit constraint in the speed plan.
    fn idm_accel(&self, vel: f64, gap: f64, leader_vel: f64) -> f64 {
        let gap = f64::max(gap, 0.01);
        let appr = vel - leader_vel;
        let factor = 1.0 / (2.0 * (self.max_accel * self.max_decel).sqrt());
        let ss = self.min_gap + vel * self.headway + vel * appr * factor;
        self.max_accel * (1.0 - (ss / gap).powi(2))
    }

    /// The distance needed to comfortably come to a halt from `vel`.
    pub fn stopping_distance(&self, vel: f64) -> f64 {
        vel * self.headway + vel.powi(2) / (2.0 * self.max_decel)
    }
}

impl SpeedPlan {
    /// Resets the plan at the start of a tick. The initial candidate is the
    /// free acceleration, or the externally forced speed if one is set.
    pub fn reset(&self, vel: f64, params: &ModelParams, overridden: Option<f64>, dt: f64) {
        let free = vel + params.max_accel * dt;
        let v = match overridden {
            Some(v) => f64::min(f64::max(v, 0.0), free),
            None => free,
        };
        self.v_next.set(v);
        self.forced.set(false);
    }

    /// Constrains the candidate velocity from above.
    pub fn apply(&self, vel: f64) {
        self.v_next.set(f64::min(self.v_next.get(), vel));
    }

    /// Demands a full stop without reporting a near-miss.
    pub fn force_stop(&self) {
        self.v_next.set(0.0);
        self.forced.set(true);
    }

    /// The current candidate velocity.
    pub fn current(&self) -> f64 {
        self.v_next.get()
    }

    /// Resolves the plan into the next velocity, applying dawdling and the
    /// per-tick deceleration bounds. Dawdling only ever lowers the speed, so
    /// the result cannot exceed the accumulated safe bound.
    pub fn resolve(&self, vel: f64, params: &ModelParams, rng: &mut StdRng, dt: f64) -> ResolvedSpeed {
        let candidate = self.v_next.get();

        // Dawdling is driver laxity, not braking; the near-miss flag is
        // judged on the pre-dawdle candidate.
        let comf_floor = f64::max(vel - params.max_decel * dt, 0.0);
        let emergency = candidate < comf_floor && !self.forced.get();

        let mut v = candidate;
        if params.imperfection > 0.0 {
            v -= params.imperfection * params.max_accel * dt * rng.gen::<f64>();
        }
        v = f64::max(v, 0.0);

        if v < comf_floor {
            // Braking harder than comfortable; never beyond the emergency rate.
            let hard_floor = f64::max(vel - params.emergency_decel * dt, 0.0);
            v = f64::max(v, hard_floor);
        }

        ResolvedSpeed { vel: v, emergency }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;

    fn params() -> ModelParams {
        ModelParams {
            max_accel: 2.0,
            max_decel: 4.0,
            emergency_decel: 8.0,
            min_gap: 2.0,
            headway: 1.0,
            imperfection: 0.0,
        }
    }

    #[test]
    fn validate_rejects_bad_params() {
        assert!(params().validate().is_ok());
        assert!(ModelParams { max_decel: 0.0, ..params() }.validate().is_err());
        assert!(ModelParams { max_accel: -1.0, ..params() }.validate().is_err());
        assert!(ModelParams { emergency_decel: 1.0, ..params() }.validate().is_err());
        assert!(ModelParams { imperfection: 1.5, ..params() }.validate().is_err());
    }

    #[test]
    fn safe_speed_zero_at_min_gap() {
        let model = CarFollowModel::Krauss(params());
        assert_approx_eq!(model.follow_speed(10.0, 2.0, 0.0, 4.0, 0.1), 0.0);
        assert_approx_eq!(model.follow_speed(10.0, -1.0, 0.0, 4.0, 0.1), 0.0);
    }

    #[test]
    fn safe_speed_honours_worst_case_braking() {
        let p = params();
        let model = CarFollowModel::Krauss(p);
        for gap in [5.0, 10.0, 25.0, 80.0] {
            for leader_vel in [0.0, 5.0, 15.0] {
                let v = model.follow_speed(10.0, gap, leader_vel, p.max_decel, 0.1);
                // Own stopping distance must fit into the gap plus the
                // leader's stopping distance.
                let own = v * p.headway + v.powi(2) / (2.0 * p.max_decel);
                let theirs = leader_vel.powi(2) / (2.0 * p.max_decel);
                assert!(own <= gap - p.min_gap + theirs + 1e-9);
            }
        }
    }

    #[test]
    fn secure_gap_matches_safe_speed() {
        let p = params();
        let model = CarFollowModel::Krauss(p);
        let gap = model.secure_gap(12.0, 8.0, 4.0);
        let v = model.follow_speed(12.0, gap, 8.0, 4.0, 0.1);
        assert!(v >= 12.0 - 1e-9);
    }

    #[test]
    fn idm_is_clipped_to_safe_speed() {
        let p = params();
        let krauss = CarFollowModel::Krauss(p);
        let idm = CarFollowModel::Idm(p);
        for gap in [3.0, 6.0, 12.0, 40.0] {
            let v_idm = idm.follow_speed(15.0, gap, 5.0, 4.0, 0.1);
            let v_safe = krauss.follow_speed(15.0, gap, 5.0, 4.0, 0.1);
            assert!(v_idm <= v_safe + 1e-9);
        }
    }

    #[test]
    fn plan_resolves_with_emergency_floor() {
        let p = params();
        let plan = SpeedPlan::default();
        plan.reset(10.0, &p, None, 0.1);
        plan.apply(0.0);
        let out = plan.resolve(10.0, &p, &mut StdRng::seed_from_u64(1), 0.1);
        assert!(out.emergency);
        assert_approx_eq!(out.vel, 10.0 - p.emergency_decel * 0.1);
    }

    #[test]
    fn dawdle_alone_is_not_a_near_miss() {
        // Dawdling can exceed the comfortable margin when the imperfection
        // and acceleration are large; that must not count as a near miss.
        let p = ModelParams {
            max_accel: 6.0,
            imperfection: 1.0,
            ..params()
        };
        for seed in 0..20 {
            let plan = SpeedPlan::default();
            plan.reset(10.0, &p, None, 0.1);
            // Just above the comfortable floor of 9.6.
            plan.apply(9.65);
            let out = plan.resolve(10.0, &p, &mut StdRng::seed_from_u64(seed), 0.1);
            assert!(!out.emergency);
            assert!(out.vel >= 10.0 - p.emergency_decel * 0.1 - 1e-9);
        }
    }

    #[test]
    fn plan_override_is_clamped() {
        let p = params();
        let plan = SpeedPlan::default();
        plan.reset(10.0, &p, Some(100.0), 0.1);
        assert_approx_eq!(plan.current(), 10.0 + p.max_accel * 0.1);
        plan.reset(10.0, &p, Some(-5.0), 0.1);
        assert_approx_eq!(plan.current(), 0.0);
    }
}
