//! The interpreter adapter: canonical machining calls → task items.
//!
//! The G-code interpreter proper is an external collaborator; what it
//! emits is the canonical-call surface (STRAIGHT_FEED, ARC_FEED,
//! DWELL, …). `CanonAdapter` implements that surface, maintaining the
//! interpreter's end-point model — repeated queries without hardware
//! feedback return the last commanded endpoint — and translating each
//! call into a [`TaskItem`] tagged with the current source line.

use rmc_common::io_cmd::IoCommand;
use rmc_common::motion_cmd::{
    CircleArgs, LineArgs, MotionCommand, MotionType, ProbeArgs, RigidTapArgs, SegmentEnables,
    TermCond,
};
use rmc_common::pose::{Cart, Pose};

use crate::interp_list::{TaskItem, TaskOp};

/// Result of pulling one block from an interpreter.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanReadResult {
    /// Block consumed; items may have been emitted.
    Ok,
    /// Block consumed, and the interpreter requires a synchronization
    /// barrier before reading further.
    ExecuteFinish,
    /// Program exhausted.
    Eof,
    Error(String),
}

/// The boundary the task FSM drives: one `plan_read` per pipeline
/// slot, items delivered through the sink.
pub trait Interpreter {
    /// Read and execute the next block, pushing emitted items.
    fn plan_read(&mut self, sink: &mut dyn FnMut(TaskItem)) -> PlanReadResult;

    /// Source line of the most recent block.
    fn line(&self) -> i32;

    /// Re-synchronize the interpreter's world model to the machine
    /// (after barriers and aborts).
    fn resync(&mut self);

    /// Rewind to the start of the program.
    fn reset(&mut self);
}

/// End-point-model state plus the translation into task items.
#[derive(Debug, Clone)]
pub struct CanonAdapter {
    /// Last commanded endpoint (the interpreter's position model).
    pub position: Pose,
    pub feed_rate: f64,
    pub traverse_rate: f64,
    pub acceleration: f64,
    pub spindle_speed: f64,
    pub line_id: i32,
    pub enables: SegmentEnables,
    /// Program origin offset applied to incoming coordinates.
    pub origin: Pose,
    pub tool_length_offset: f64,
    /// Machine position for tool changes, with an optional holder
    /// clearance point passed through first.
    pub tool_change_position: Option<Pose>,
    pub tool_holder_clear: Option<Pose>,
}

impl CanonAdapter {
    pub fn new(traverse_rate: f64, acceleration: f64) -> Self {
        Self {
            position: Pose::ZERO,
            feed_rate: 1.0,
            traverse_rate,
            acceleration,
            spindle_speed: 0.0,
            line_id: 0,
            enables: SegmentEnables::FEED_OVERRIDE
                | SegmentEnables::FEED_HOLD
                | SegmentEnables::ADAPTIVE_FEED,
            origin: Pose::ZERO,
            tool_length_offset: 0.0,
            tool_change_position: None,
            tool_holder_clear: None,
        }
    }

    fn item(&self, op: TaskOp) -> TaskItem {
        TaskItem {
            line_id: self.line_id,
            op,
        }
    }

    fn offset(&self, p: &Pose) -> Pose {
        let mut out = p.add(&self.origin);
        out.z += self.tool_length_offset;
        out
    }

    // ─── Canonical calls ────────────────────────────────────────────

    pub fn set_line_number(&mut self, line: i32) {
        self.line_id = line;
    }

    pub fn set_feed_rate(&mut self, rate: f64) {
        self.feed_rate = rate;
    }

    pub fn set_spindle_speed(&mut self, speed: f64) -> TaskItem {
        self.spindle_speed = speed;
        self.item(TaskOp::Motion(MotionCommand::SetSpindle(
            rmc_common::motion_cmd::SpindleOnArgs {
                speed,
                css_factor: 0.0,
                x_offset: 0.0,
            },
        )))
    }

    pub fn straight_traverse(&mut self, end: Pose) -> TaskItem {
        let end = self.offset(&end);
        self.position = end;
        self.item(TaskOp::Motion(MotionCommand::SetLine(LineArgs {
            end,
            motion_type: MotionType::Traverse,
            id: self.line_id,
            vel: self.traverse_rate,
            ini_maxvel: self.traverse_rate,
            acc: self.acceleration,
            enables: SegmentEnables::FEED_OVERRIDE,
        })))
    }

    pub fn straight_feed(&mut self, end: Pose) -> TaskItem {
        let end = self.offset(&end);
        self.position = end;
        self.item(TaskOp::Motion(MotionCommand::SetLine(LineArgs {
            end,
            motion_type: MotionType::Feed,
            id: self.line_id,
            vel: self.feed_rate,
            ini_maxvel: self.traverse_rate,
            acc: self.acceleration,
            enables: self.enables,
        })))
    }

    /// ARC_FEED in the active plane: `center`/`normal` select the
    /// plane, `turn` the direction and full revolutions.
    pub fn arc_feed(&mut self, end: Pose, center: Cart, normal: Cart, turn: i32) -> TaskItem {
        let end = self.offset(&end);
        self.position = end;
        self.item(TaskOp::Motion(MotionCommand::SetCircle(CircleArgs {
            end,
            center,
            normal,
            turn,
            id: self.line_id,
            vel: self.feed_rate,
            ini_maxvel: self.traverse_rate,
            acc: self.acceleration,
            enables: self.enables,
        })))
    }

    pub fn straight_probe(&mut self, end: Pose) -> TaskItem {
        let end = self.offset(&end);
        // The endpoint model keeps the *commanded* target; the actual
        // probe result is read back from motion status by the caller.
        self.position = end;
        self.item(TaskOp::Motion(MotionCommand::SetProbe(ProbeArgs {
            end,
            motion_type: MotionType::Probing,
            id: self.line_id,
            vel: self.feed_rate,
            ini_maxvel: self.traverse_rate,
            acc: self.acceleration,
        })))
    }

    pub fn rigid_tap(&mut self, end: Pose) -> TaskItem {
        let end = self.offset(&end);
        // Position model: the tap returns to its start point.
        self.item(TaskOp::Motion(MotionCommand::SetRigidTap(RigidTapArgs {
            end,
            id: self.line_id,
            vel: self.feed_rate,
            ini_maxvel: self.traverse_rate,
            acc: self.acceleration,
        })))
    }

    pub fn set_term_cond(&mut self, cond: TermCond, tolerance: f64) -> TaskItem {
        self.item(TaskOp::Motion(MotionCommand::SetTermCond {
            cond,
            tolerance,
        }))
    }

    pub fn set_spindle_sync(&mut self, feed_per_rev: f64, wait_for_index: bool) -> TaskItem {
        self.item(TaskOp::Motion(MotionCommand::SetSpindleSync {
            feed_per_rev,
            wait_for_index,
        }))
    }

    pub fn dwell(&mut self, seconds: f64) -> TaskItem {
        self.item(TaskOp::Dwell { seconds })
    }

    pub fn use_tool_length_offset(&mut self, offset: f64) -> TaskItem {
        self.tool_length_offset = offset;
        self.item(TaskOp::Io(IoCommand::ToolSetOffset {
            tool: 0,
            length: offset,
            diameter: 0.0,
        }))
    }

    pub fn set_origin_offsets(&mut self, origin: Pose) {
        self.origin = origin;
    }

    pub fn coolant_flood(&mut self, on: bool) -> TaskItem {
        self.item(TaskOp::Io(if on {
            IoCommand::CoolantFloodOn
        } else {
            IoCommand::CoolantFloodOff
        }))
    }

    pub fn coolant_mist(&mut self, on: bool) -> TaskItem {
        self.item(TaskOp::Io(if on {
            IoCommand::CoolantMistOn
        } else {
            IoCommand::CoolantMistOff
        }))
    }

    pub fn tool_prepare(&mut self, pocket: u16) -> TaskItem {
        self.item(TaskOp::Io(IoCommand::ToolPrepare { pocket }))
    }

    /// Tool change: rapid through the holder clearance point and the
    /// change position when configured, then swap.
    pub fn tool_change(&mut self) -> Vec<TaskItem> {
        let mut items = Vec::new();
        if let Some(clear) = self.tool_holder_clear {
            self.position = clear;
            items.push(self.item(TaskOp::Motion(MotionCommand::SetLine(LineArgs {
                end: clear,
                motion_type: MotionType::ToolChange,
                id: self.line_id,
                vel: self.traverse_rate,
                ini_maxvel: self.traverse_rate,
                acc: self.acceleration,
                enables: SegmentEnables::empty(),
            }))));
        }
        if let Some(change) = self.tool_change_position {
            self.position = change;
            items.push(self.item(TaskOp::Motion(MotionCommand::SetLine(LineArgs {
                end: change,
                motion_type: MotionType::ToolChange,
                id: self.line_id,
                vel: self.traverse_rate,
                ini_maxvel: self.traverse_rate,
                acc: self.acceleration,
                enables: SegmentEnables::empty(),
            }))));
        }
        items.push(self.item(TaskOp::Io(IoCommand::ToolLoad)));
        items
    }

    pub fn operator_message(&mut self, text: &str) -> TaskItem {
        self.item(TaskOp::OperatorMessage(text.to_string()))
    }

    pub fn system_cmd(&mut self, cmd: &str) -> TaskItem {
        self.item(TaskOp::SystemCmd(cmd.to_string()))
    }

    pub fn program_end(&mut self) -> TaskItem {
        self.item(TaskOp::End)
    }

    /// The end-point model: last commanded endpoint, no hardware
    /// feedback involved.
    pub fn current_position(&self) -> Pose {
        self.position
    }

    /// Resync the model from actual machine state.
    pub fn sync_position(&mut self, actual: Pose) {
        self.position = actual;
    }
}

/// A canned program of already-translated items; the test and MDI
/// harness for the FSM (one `plan_read` consumes one block's worth).
pub struct ScriptInterp {
    blocks: Vec<(Vec<TaskItem>, PlanReadResult)>,
    cursor: usize,
    line: i32,
}

impl ScriptInterp {
    pub fn new(blocks: Vec<(Vec<TaskItem>, PlanReadResult)>) -> Self {
        Self {
            blocks,
            cursor: 0,
            line: 0,
        }
    }

    /// Single-block program (MDI).
    pub fn mdi(items: Vec<TaskItem>) -> Self {
        Self::new(vec![(items, PlanReadResult::Ok)])
    }
}

impl Interpreter for ScriptInterp {
    fn plan_read(&mut self, sink: &mut dyn FnMut(TaskItem)) -> PlanReadResult {
        let Some((items, result)) = self.blocks.get(self.cursor) else {
            return PlanReadResult::Eof;
        };
        self.cursor += 1;
        for item in items {
            self.line = item.line_id;
            sink(item.clone());
        }
        result.clone()
    }

    fn line(&self) -> i32 {
        self.line
    }

    fn resync(&mut self) {}

    fn reset(&mut self) {
        self.cursor = 0;
        self.line = 0;
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
    fn endpoint_model_tracks_commands() {
        let mut canon = CanonAdapter::new(50.0, 200.0);
        canon.set_line_number(10);
        canon.set_feed_rate(5.0);
        canon.straight_feed(pose(1.0, 2.0, 3.0));
        assert_eq!(canon.current_position(), pose(1.0, 2.0, 3.0));
        // Repeated queries without feedback return the same endpoint.
        assert_eq!(canon.current_position(), pose(1.0, 2.0, 3.0));
    }

    #[test]
    fn items_carry_the_line_id() {
        let mut canon = CanonAdapter::new(50.0, 200.0);
        canon.set_line_number(42);
        let item = canon.straight_feed(pose(1.0, 0.0, 0.0));
        assert_eq!(item.line_id, 42);
        let TaskOp::Motion(MotionCommand::SetLine(args)) = item.op else {
            panic!("expected a line command");
        };
        assert_eq!(args.id, 42);
        assert_eq!(args.vel, 1.0);
    }

    #[test]
    fn origin_offset_applies_to_endpoints() {
        let mut canon = CanonAdapter::new(50.0, 200.0);
        canon.set_origin_offsets(pose(10.0, 0.0, 0.0));
        let item = canon.straight_traverse(pose(5.0, 0.0, 0.0));
        let TaskOp::Motion(MotionCommand::SetLine(args)) = item.op else {
            panic!("expected a line command");
        };
        assert_eq!(args.end.x, 15.0);
        assert_eq!(canon.current_position().x, 15.0);
    }

    #[test]
    fn tool_length_offset_lifts_z() {
        let mut canon = CanonAdapter::new(50.0, 200.0);
        canon.use_tool_length_offset(2.5);
        let item = canon.straight_feed(pose(0.0, 0.0, 1.0));
        let TaskOp::Motion(MotionCommand::SetLine(args)) = item.op else {
            panic!("expected a line command");
        };
        assert_eq!(args.end.z, 3.5);
    }

    #[test]
    fn traverse_uses_rapid_rate_and_feed_uses_feed_rate() {
        let mut canon = CanonAdapter::new(50.0, 200.0);
        canon.set_feed_rate(7.0);
        let t = canon.straight_traverse(pose(1.0, 0.0, 0.0));
        let f = canon.straight_feed(pose(2.0, 0.0, 0.0));
        let (TaskOp::Motion(MotionCommand::SetLine(ta)), TaskOp::Motion(MotionCommand::SetLine(fa))) =
            (t.op, f.op)
        else {
            panic!("expected line commands");
        };
        assert_eq!(ta.vel, 50.0);
        assert_eq!(ta.motion_type, MotionType::Traverse);
        assert_eq!(fa.vel, 7.0);
        assert_eq!(fa.motion_type, MotionType::Feed);
    }

    #[test]
    fn tool_change_routes_through_change_position() {
        let mut canon = CanonAdapter::new(50.0, 200.0);
        canon.tool_change_position = Some(pose(0.0, 0.0, 50.0));
        canon.tool_holder_clear = Some(pose(0.0, 0.0, 60.0));
        let items = canon.tool_change();
        assert_eq!(items.len(), 3);
        let TaskOp::Motion(MotionCommand::SetLine(first)) = &items[0].op else {
            panic!("expected the clearance move first");
        };
        assert_eq!(first.end.z, 60.0);
        assert_eq!(first.motion_type, MotionType::ToolChange);
        assert!(matches!(items[2].op, TaskOp::Io(IoCommand::ToolLoad)));
        assert_eq!(canon.current_position().z, 50.0);
    }

    #[test]
    fn tool_change_without_position_is_just_the_swap() {
        let mut canon = CanonAdapter::new(50.0, 200.0);
        let items = canon.tool_change();
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0].op, TaskOp::Io(IoCommand::ToolLoad)));
    }

    #[test]
    fn rigid_tap_leaves_endpoint_at_start() {
        let mut canon = CanonAdapter::new(50.0, 200.0);
        canon.straight_feed(pose(0.0, 0.0, 5.0));
        canon.rigid_tap(pose(0.0, 0.0, -10.0));
        assert_eq!(canon.current_position(), pose(0.0, 0.0, 5.0));
    }

    #[test]
    fn script_interp_replays_blocks() {
        let mut interp = ScriptInterp::new(vec![
            (
                vec![TaskItem {
                    line_id: 1,
                    op: TaskOp::Dwell { seconds: 0.1 },
                }],
                PlanReadResult::Ok,
            ),
            (vec![], PlanReadResult::Eof),
        ]);
        let mut got = Vec::new();
        let result = interp.plan_read(&mut |item| got.push(item));
        assert_eq!(result, PlanReadResult::Ok);
        assert_eq!(got.len(), 1);
        assert_eq!(interp.line(), 1);
        assert_eq!(interp.plan_read(&mut |_| {}), PlanReadResult::Eof);
        interp.reset();
        assert_eq!(interp.plan_read(&mut |item| got.push(item)), PlanReadResult::Ok);
    }
}
