//! Motion segment geometry.
//!
//! A segment knows its endpoints, its length, and how to map progress
//! along its path to a pose. Lines parameterize by Euclidean
//! displacement (falling back to rotary displacement for pure-rotary
//! moves); arcs parameterize by planar arc length with the normal
//! component and rotary axes interpolated linearly in progress.

use rmc_common::motion_cmd::{MotionType, SegmentEnables, TermCond};
use rmc_common::pose::{Cart, Pose};

/// Lengths below this are treated as zero (consumed in place).
pub const ZERO_LENGTH: f64 = 1e-9;

/// Arc geometry, precomputed at enqueue time.
#[derive(Debug, Clone, Copy)]
pub struct ArcGeom {
    center: Cart,
    /// In-plane basis: `u` points at the start, `v = w × u`.
    u: Cart,
    v: Cart,
    /// Unit normal.
    w: Cart,
    radius: f64,
    /// Total swept angle, always positive; `cw` flips the direction.
    angle: f64,
    cw: bool,
    /// Start offset and total travel along the normal (helix).
    base_w: f64,
    helix: f64,
}

impl ArcGeom {
    /// Build from endpoints, center, plane normal, and turn count.
    /// `turn` counts full revolutions; its sign selects direction
    /// (positive = counterclockwise about the normal). Returns `None`
    /// for degenerate geometry (zero radius or unusable normal).
    pub fn new(start: &Pose, end: &Pose, center: Cart, normal: Cart, turn: i32) -> Option<Self> {
        let w = normal.unit().unwrap_or(Cart::new(0.0, 0.0, 1.0));
        let s = Cart::new(start.x, start.y, start.z).sub(&center);
        let e = Cart::new(end.x, end.y, end.z).sub(&center);

        let base_w = s.dot(&w);
        let helix = e.dot(&w) - base_w;

        let s_proj = s.sub(&w.scale(base_w));
        let radius = s_proj.norm();
        if radius < ZERO_LENGTH {
            return None;
        }
        let u = s_proj.unit()?;
        let v = w.cross(&u);

        let e_proj = e.sub(&w.scale(e.dot(&w)));
        // Angle of the endpoint in the (u, v) frame, (−π, π].
        let end_angle = e_proj.dot(&v).atan2(e_proj.dot(&u));

        let cw = turn < 0;
        let extra = (turn.unsigned_abs().max(1) - 1) as f64;
        // Base sweep in (0, 2π]: a full circle, not a no-op, when the
        // endpoints coincide.
        let base = if cw {
            let a = -end_angle;
            if a <= ZERO_LENGTH {
                a + core::f64::consts::TAU
            } else {
                a
            }
        } else if end_angle <= ZERO_LENGTH {
            end_angle + core::f64::consts::TAU
        } else {
            end_angle
        };
        let angle = base + extra * core::f64::consts::TAU;

        Some(Self {
            center,
            u,
            v,
            w,
            radius,
            angle,
            cw,
            base_w,
            helix,
        })
    }

    /// Planar arc length plus the helical component.
    pub fn length(&self) -> f64 {
        let planar = self.radius * self.angle;
        (planar * planar + self.helix * self.helix).sqrt()
    }

    /// Cartesian point at `frac` of the sweep.
    pub fn point_at(&self, frac: f64) -> Cart {
        let theta = if self.cw {
            -self.angle * frac
        } else {
            self.angle * frac
        };
        let radial = self
            .u
            .scale(self.radius * theta.cos())
            .add(&self.v.scale(self.radius * theta.sin()));
        self.center
            .add(&radial)
            .add(&self.w.scale(self.base_w + self.helix * frac))
    }

    /// Unit tangent at `frac` (xyz only).
    pub fn tangent_at(&self, frac: f64) -> Cart {
        let theta = if self.cw {
            -self.angle * frac
        } else {
            self.angle * frac
        };
        let sign = if self.cw { -1.0 } else { 1.0 };
        let planar = self
            .u
            .scale(-theta.sin())
            .add(&self.v.scale(theta.cos()))
            .scale(sign * self.radius * self.angle);
        planar
            .add(&self.w.scale(self.helix))
            .unit()
            .unwrap_or(Cart::new(0.0, 0.0, 0.0))
    }

    pub fn sweep(&self) -> f64 {
        self.angle
    }
}

/// Rigid-tap execution phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TapPhase {
    #[default]
    Tapping,
    /// Endpoint reached; spindle reversal commanded, still overshooting.
    Reversing,
    Retracting,
}

/// Segment path shape.
#[derive(Debug, Clone, Copy)]
pub enum SegGeom {
    Line,
    Arc(ArcGeom),
    /// Straight synchronized tap; carries its phase.
    Tap(TapPhase),
}

/// One element of the trajectory queue.
#[derive(Debug, Clone)]
pub struct MotionSegment {
    pub id: i32,
    pub start: Pose,
    pub end: Pose,
    pub geom: SegGeom,
    pub motion_type: MotionType,
    /// Requested path velocity [units/s].
    pub reqvel: f64,
    /// Hard cap from configuration.
    pub maxvel: f64,
    pub acc: f64,
    pub enables: SegmentEnables,
    pub term: TermCond,
    pub tolerance: f64,
    /// Feed per spindle revolution; 0 = time-driven.
    pub feed_per_rev: f64,
    pub length: f64,

    // Runtime.
    pub progress: f64,
    pub currentvel: f64,
    /// Planned exit velocity after blending.
    pub finalvel: f64,
    pub active: bool,

    /// Synchronized outputs fired at segment start / completion.
    pub douts_start: heapless::Vec<(u8, bool), 4>,
    pub douts_end: heapless::Vec<(u8, bool), 4>,
    pub aouts_start: heapless::Vec<(u8, f64), 2>,
    pub aouts_end: heapless::Vec<(u8, f64), 2>,
}

impl MotionSegment {
    /// Straight segment. Length falls back to the rotary displacement
    /// for moves with no Cartesian travel.
    #[allow(clippy::too_many_arguments)]
    pub fn line(
        id: i32,
        start: Pose,
        end: Pose,
        motion_type: MotionType,
        reqvel: f64,
        maxvel: f64,
        acc: f64,
        enables: SegmentEnables,
        term: TermCond,
        tolerance: f64,
    ) -> Self {
        let delta = end.sub(&start);
        let xyz = delta.xyz_norm();
        let length = if xyz > ZERO_LENGTH { xyz } else { delta.norm() };
        Self {
            id,
            start,
            end,
            geom: SegGeom::Line,
            motion_type,
            reqvel,
            maxvel,
            acc,
            enables,
            term,
            tolerance,
            feed_per_rev: 0.0,
            length,
            progress: 0.0,
            currentvel: 0.0,
            finalvel: 0.0,
            active: false,
            douts_start: heapless::Vec::new(),
            douts_end: heapless::Vec::new(),
            aouts_start: heapless::Vec::new(),
            aouts_end: heapless::Vec::new(),
        }
    }

    /// Arc segment; `None` for degenerate geometry.
    #[allow(clippy::too_many_arguments)]
    pub fn arc(
        id: i32,
        start: Pose,
        end: Pose,
        center: Cart,
        normal: Cart,
        turn: i32,
        reqvel: f64,
        maxvel: f64,
        acc: f64,
        enables: SegmentEnables,
        term: TermCond,
        tolerance: f64,
    ) -> Option<Self> {
        let geom = ArcGeom::new(&start, &end, center, normal, turn)?;
        let length = geom.length();
        Some(Self {
            id,
            start,
            end,
            geom: SegGeom::Arc(geom),
            motion_type: MotionType::Arc,
            reqvel,
            maxvel,
            acc,
            enables,
            term,
            tolerance,
            feed_per_rev: 0.0,
            length,
            progress: 0.0,
            currentvel: 0.0,
            finalvel: 0.0,
            active: false,
            douts_start: heapless::Vec::new(),
            douts_end: heapless::Vec::new(),
            aouts_start: heapless::Vec::new(),
            aouts_end: heapless::Vec::new(),
        })
    }

    /// Rigid tap: a straight synchronized segment that reverses at
    /// the endpoint and completes back at the start.
    pub fn rigid_tap(
        id: i32,
        start: Pose,
        end: Pose,
        reqvel: f64,
        maxvel: f64,
        acc: f64,
        feed_per_rev: f64,
    ) -> Self {
        let mut seg = Self::line(
            id,
            start,
            end,
            MotionType::Feed,
            reqvel,
            maxvel,
            acc,
            SegmentEnables::SPINDLE_OVERRIDE,
            TermCond::ExactStop,
            0.0,
        );
        seg.geom = SegGeom::Tap(TapPhase::Tapping);
        seg.feed_per_rev = feed_per_rev;
        seg
    }

    #[inline]
    pub fn is_zero_length(&self) -> bool {
        self.length < ZERO_LENGTH
    }

    #[inline]
    pub fn remaining(&self) -> f64 {
        (self.length - self.progress).max(0.0)
    }

    /// Pose at path progress `s` (same parameter as `length`). For
    /// tap overshoot `s` may exceed the length; lines extrapolate.
    pub fn pose_at(&self, s: f64) -> Pose {
        if self.is_zero_length() {
            return self.end;
        }
        let frac = s / self.length;
        match &self.geom {
            SegGeom::Line | SegGeom::Tap(_) => {
                self.start.add(&self.end.sub(&self.start).scale(frac))
            }
            SegGeom::Arc(arc) => {
                let frac = frac.clamp(0.0, 1.0);
                let xyz = arc.point_at(frac);
                let mut pose = self.start.add(&self.end.sub(&self.start).scale(frac));
                pose.x = xyz.x;
                pose.y = xyz.y;
                pose.z = xyz.z;
                pose
            }
        }
    }

    /// Unit tangent at the start of the segment (xyz space).
    pub fn tangent_in(&self) -> Cart {
        match &self.geom {
            SegGeom::Line | SegGeom::Tap(_) => {
                let d = self.end.sub(&self.start);
                Cart::new(d.x, d.y, d.z)
                    .unit()
                    .unwrap_or(Cart::new(0.0, 0.0, 0.0))
            }
            SegGeom::Arc(arc) => arc.tangent_at(0.0),
        }
    }

    /// Unit tangent at the end of the segment (xyz space).
    pub fn tangent_out(&self) -> Cart {
        match &self.geom {
            SegGeom::Line | SegGeom::Tap(_) => self.tangent_in(),
            SegGeom::Arc(arc) => arc.tangent_at(1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pose(x: f64, y: f64, z: f64) -> Pose {
        Pose {
            x,
            y,
            z,
            ..Pose::ZERO
        }
    }

    #[test]
    fn line_length_and_midpoint() {
        let seg = MotionSegment::line(
            1,
            pose(0.0, 0.0, 0.0),
            pose(3.0, 4.0, 0.0),
            MotionType::Feed,
            10.0,
            20.0,
            100.0,
            SegmentEnables::empty(),
            TermCond::ExactStop,
            0.0,
        );
        assert_eq!(seg.length, 5.0);
        let mid = seg.pose_at(2.5);
        assert!((mid.x - 1.5).abs() < 1e-12);
        assert!((mid.y - 2.0).abs() < 1e-12);
    }

    #[test]
    fn rotary_only_line_uses_rotary_length() {
        let mut end = Pose::ZERO;
        end.a = 90.0;
        let seg = MotionSegment::line(
            1,
            Pose::ZERO,
            end,
            MotionType::Feed,
            10.0,
            20.0,
            100.0,
            SegmentEnables::empty(),
            TermCond::ExactStop,
            0.0,
        );
        assert_eq!(seg.length, 90.0);
        assert!((seg.pose_at(45.0).a - 45.0).abs() < 1e-12);
    }

    #[test]
    fn quarter_arc_sweeps_90_degrees() {
        // CCW quarter circle in XY: (1,0) → (0,1) about origin.
        let seg = MotionSegment::arc(
            1,
            pose(1.0, 0.0, 0.0),
            pose(0.0, 1.0, 0.0),
            Cart::ZERO,
            Cart::new(0.0, 0.0, 1.0),
            1,
            10.0,
            20.0,
            100.0,
            SegmentEnables::empty(),
            TermCond::ExactStop,
            0.0,
        )
        .unwrap();
        let arc_len = core::f64::consts::FRAC_PI_2;
        assert!((seg.length - arc_len).abs() < 1e-12);
        let mid = seg.pose_at(seg.length / 2.0);
        let r = (mid.x * mid.x + mid.y * mid.y).sqrt();
        assert!((r - 1.0).abs() < 1e-12, "stays on the circle");
        assert!(mid.x > 0.0 && mid.y > 0.0, "ccw through the first quadrant");
        let end = seg.pose_at(seg.length);
        assert!((end.x - 0.0).abs() < 1e-9 && (end.y - 1.0).abs() < 1e-9);
    }

    #[test]
    fn clockwise_arc_goes_the_other_way() {
        let seg = MotionSegment::arc(
            1,
            pose(1.0, 0.0, 0.0),
            pose(0.0, 1.0, 0.0),
            Cart::ZERO,
            Cart::new(0.0, 0.0, 1.0),
            -1,
            10.0,
            20.0,
            100.0,
            SegmentEnables::empty(),
            TermCond::ExactStop,
            0.0,
        )
        .unwrap();
        // CW from (1,0) to (0,1) is the long way: 3π/2.
        assert!((seg.sweep_for_test() - 1.5 * core::f64::consts::PI).abs() < 1e-12);
        let mid = seg.pose_at(seg.length / 2.0);
        assert!(mid.y < 0.0, "cw passes below the x axis");
    }

    #[test]
    fn full_circle_turn_one() {
        let seg = MotionSegment::arc(
            1,
            pose(2.0, 0.0, 0.0),
            pose(2.0, 0.0, 0.0),
            Cart::ZERO,
            Cart::new(0.0, 0.0, 1.0),
            1,
            10.0,
            20.0,
            100.0,
            SegmentEnables::empty(),
            TermCond::ExactStop,
            0.0,
        )
        .unwrap();
        assert!((seg.sweep_for_test() - core::f64::consts::TAU).abs() < 1e-12);
        assert!((seg.length - 2.0 * core::f64::consts::TAU).abs() < 1e-12);
    }

    #[test]
    fn two_turns_doubles_the_sweep() {
        let seg = MotionSegment::arc(
            1,
            pose(1.0, 0.0, 0.0),
            pose(1.0, 0.0, 0.0),
            Cart::ZERO,
            Cart::new(0.0, 0.0, 1.0),
            2,
            10.0,
            20.0,
            100.0,
            SegmentEnables::empty(),
            TermCond::ExactStop,
            0.0,
        )
        .unwrap();
        assert!((seg.sweep_for_test() - 2.0 * core::f64::consts::TAU).abs() < 1e-12);
    }

    #[test]
    fn helical_arc_lifts_linearly() {
        let seg = MotionSegment::arc(
            1,
            pose(1.0, 0.0, 0.0),
            pose(1.0, 0.0, 5.0),
            Cart::ZERO,
            Cart::new(0.0, 0.0, 1.0),
            1,
            10.0,
            20.0,
            100.0,
            SegmentEnables::empty(),
            TermCond::ExactStop,
            0.0,
        )
        .unwrap();
        let mid = seg.pose_at(seg.length / 2.0);
        assert!((mid.z - 2.5).abs() < 1e-9);
        let end = seg.pose_at(seg.length);
        assert!((end.z - 5.0).abs() < 1e-9);
    }

    #[test]
    fn degenerate_arc_is_rejected() {
        assert!(MotionSegment::arc(
            1,
            pose(0.0, 0.0, 0.0),
            pose(0.0, 0.0, 0.0),
            Cart::ZERO, // start on center: zero radius
            Cart::new(0.0, 0.0, 1.0),
            1,
            10.0,
            20.0,
            100.0,
            SegmentEnables::empty(),
            TermCond::ExactStop,
            0.0,
        )
        .is_none());
    }

    #[test]
    fn zero_length_line() {
        let seg = MotionSegment::line(
            1,
            pose(1.0, 1.0, 1.0),
            pose(1.0, 1.0, 1.0),
            MotionType::Feed,
            10.0,
            20.0,
            100.0,
            SegmentEnables::empty(),
            TermCond::ExactStop,
            0.0,
        );
        assert!(seg.is_zero_length());
        assert_eq!(seg.pose_at(0.0), pose(1.0, 1.0, 1.0));
    }

    #[test]
    fn tangents_for_collinear_lines_match() {
        let a = MotionSegment::line(
            1,
            pose(0.0, 0.0, 0.0),
            pose(10.0, 0.0, 0.0),
            MotionType::Feed,
            10.0,
            20.0,
            100.0,
            SegmentEnables::empty(),
            TermCond::ExactStop,
            0.0,
        );
        let b = MotionSegment::line(
            2,
            pose(10.0, 0.0, 0.0),
            pose(20.0, 0.0, 0.0),
            MotionType::Feed,
            10.0,
            20.0,
            100.0,
            SegmentEnables::empty(),
            TermCond::ExactStop,
            0.0,
        );
        let t1 = a.tangent_out();
        let t2 = b.tangent_in();
        assert!((t1.dot(&t2) - 1.0).abs() < 1e-12);
    }

    impl MotionSegment {
        fn sweep_for_test(&self) -> f64 {
            match &self.geom {
                SegGeom::Arc(arc) => arc.sweep(),
                _ => 0.0,
            }
        }
    }
}
