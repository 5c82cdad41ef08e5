pub mod bridge;

use std::collections::BTreeMap;

use crate::command_log::{CommandLog, Entry, Op, TurtleId};

pub const DEFAULT_SPEED: u8 = 6;
pub const DEFAULT_SHAPE: &str = "classic";
pub const DEFAULT_COLOR: &str = "black";

// ----------------------------------------------------------------------------
// State shared by the shim and the player
// ----------------------------------------------------------------------------

/// Position (origin centre, y up) and heading (degrees, counter-clockwise, 0 = +x).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub heading: f64,
}

impl Pose {
    /// The pose after moving `distance` along the current heading.
    pub fn advance(&self, distance: f64) -> Pose {
        let rad = self.heading.to_radians();
        Pose {
            x: self.x + distance * rad.cos(),
            y: self.y + distance * rad.sin(),
            heading: self.heading,
        }
    }

    /// Heading normalised into `[0, 360)`.
    pub fn normalized_heading(&self) -> f64 {
        self.heading.rem_euclid(360.0)
    }
}

/// What applying one op means for the ink layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    None,
    /// A segment drawn with the pen down.
    Stroke {
        from: (f64, f64),
        to: (f64, f64),
        color: String,
        width: f64,
    },
    /// A closed fill polygon from `end_fill`.
    Fill { vertices: Vec<(f64, f64)>, color: String },
    Text {
        at: (f64, f64),
        text: String,
        align: String,
        font: String,
        color: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurtleState {
    pub pose: Pose,
    pub pen_down: bool,
    pub pen_color: String,
    pub fill_color: String,
    pub pen_size: f64,
    pub speed: u8,
    pub visible: bool,
    pub shape: String,
    /// Vertices visited since `begin_fill`, if filling.
    pub fill_path: Option<Vec<(f64, f64)>>,
}

impl Default for TurtleState {
    fn default() -> Self {
        Self::with_speed(DEFAULT_SPEED)
    }
}

impl TurtleState {
    pub fn with_speed(speed: u8) -> Self {
        Self {
            pose: Pose::default(),
            pen_down: true,
            pen_color: DEFAULT_COLOR.into(),
            fill_color: DEFAULT_COLOR.into(),
            pen_size: 1.0,
            speed,
            visible: true,
            shape: DEFAULT_SHAPE.into(),
            fill_path: None,
        }
    }

    /// The transition function. Both the shim and the player drive their own
    /// copies through this, so replaying a log converges on the shim's state.
    pub fn apply(&mut self, op: &Op) -> Effect {
        match op {
            Op::Forward(distance) => {
                let to = self.pose.advance(*distance);
                self.move_to(to)
            }
            Op::Goto(x, y) => {
                let to = Pose {
                    x: *x,
                    y: *y,
                    heading: self.pose.heading,
                };
                self.move_to(to)
            }
            Op::Left(angle) => {
                self.pose.heading += angle;
                Effect::None
            }
            Op::Right(angle) => {
                self.pose.heading -= angle;
                Effect::None
            }
            Op::PenUp => {
                self.pen_down = false;
                Effect::None
            }
            Op::PenDown => {
                self.pen_down = true;
                Effect::None
            }
            Op::Color(pen, fill) => {
                self.pen_color = pen.clone();
                self.fill_color = fill.clone();
                Effect::None
            }
            Op::PenColor(c) => {
                self.pen_color = c.clone();
                Effect::None
            }
            Op::FillColor(c) => {
                self.fill_color = c.clone();
                Effect::None
            }
            Op::PenSize(w) => {
                self.pen_size = *w;
                Effect::None
            }
            Op::Speed(s) => {
                self.speed = *s;
                Effect::None
            }
            Op::BeginFill => {
                self.fill_path = Some(vec![(self.pose.x, self.pose.y)]);
                Effect::None
            }
            Op::EndFill => match self.fill_path.take() {
                Some(vertices) if vertices.len() >= 3 => Effect::Fill {
                    vertices,
                    color: self.fill_color.clone(),
                },
                _ => Effect::None,
            },
            Op::Write { text, align, font } => Effect::Text {
                at: (self.pose.x, self.pose.y),
                text: text.clone(),
                align: align.clone(),
                font: font.clone(),
                color: self.pen_color.clone(),
            },
            Op::ShowTurtle => {
                self.visible = true;
                Effect::None
            }
            Op::HideTurtle => {
                self.visible = false;
                Effect::None
            }
            Op::Shape(name) => {
                self.shape = name.clone();
                Effect::None
            }
            Op::Reset => {
                *self = Self {
                    visible: self.visible,
                    shape: std::mem::take(&mut self.shape),
                    ..Self::with_speed(self.speed)
                };
                Effect::None
            }
            // Per-turtle clear has nothing to erase on a shared ink layer.
            Op::Clear | Op::CreateTurtle => Effect::None,
            Op::Bgcolor(_) | Op::ClearScreen | Op::Bye => Effect::None,
        }
    }

    fn move_to(&mut self, to: Pose) -> Effect {
        let from = (self.pose.x, self.pose.y);
        self.pose = to;
        if let Some(path) = self.fill_path.as_mut() {
            path.push((to.x, to.y));
        }
        if self.pen_down {
            Effect::Stroke {
                from,
                to: (to.x, to.y),
                color: self.pen_color.clone(),
                width: self.pen_size,
            }
        } else {
            Effect::None
        }
    }
}

/// Speed as CPython's turtle module resolves it: anything outside the open
/// interval (0.5, 10.5) is "instant", the rest rounds half to even.
pub fn speed_from_number(speed: f64) -> u8 {
    if speed > 0.5 && speed < 10.5 {
        speed.round_ties_even() as u8
    } else {
        0
    }
}

pub fn speed_from_name(name: &str) -> Option<u8> {
    match name {
        "fastest" => Some(0),
        "fast" => Some(10),
        "normal" => Some(6),
        "slow" => Some(3),
        "slowest" => Some(1),
        _ => None,
    }
}

/// Upper bound on chords per `circle` call, explicit or derived.
pub const MAX_CIRCLE_STEPS: u32 = 10_000;

/// Default segment count for a circle arc.
pub fn circle_steps(radius: f64, extent: f64) -> u32 {
    let frac = extent.abs() / 360.0;
    let steps = (11.0 + radius.abs() / 6.0).min(59.0) * frac;
    1 + (steps as u32).min(MAX_CIRCLE_STEPS - 1)
}

// ----------------------------------------------------------------------------
// Shim
// ----------------------------------------------------------------------------

/// Rust side of the Python `turtle` replacement. Keeps a local copy of every
/// turtle's state and records one log entry per mutating call.
#[derive(Debug)]
pub struct TurtleShim {
    log: CommandLog,
    turtles: BTreeMap<TurtleId, TurtleState>,
    next_id: TurtleId,
    default_turtle: Option<TurtleId>,
    default_speed: u8,
    bgcolor: String,
}

impl TurtleShim {
    pub fn new(log: CommandLog, default_speed: u8) -> Self {
        Self {
            log,
            turtles: BTreeMap::new(),
            next_id: 0,
            default_turtle: None,
            default_speed,
            bgcolor: "white".into(),
        }
    }

    pub fn log(&self) -> &CommandLog {
        &self.log
    }

    pub fn default_speed(&self) -> u8 {
        self.default_speed
    }

    /// Forget screen state at the start of a run. Ids keep counting so a
    /// turtle object left over from an earlier cell never aliases a new one.
    pub fn begin_run(&mut self) {
        self.turtles.clear();
        self.default_turtle = None;
        self.bgcolor = "white".into();
    }

    pub fn create_turtle(&mut self, shape: Option<&str>, visible: bool) -> TurtleId {
        let id = self.next_id;
        self.next_id += 1;
        self.turtles
            .insert(id, TurtleState::with_speed(self.default_speed));
        self.log.push(Entry::turtle(id, Op::CreateTurtle));
        if let Some(shape) = shape {
            self.emit(id, Op::Shape(shape.to_string()));
        }
        if !visible {
            self.emit(id, Op::HideTurtle);
        }
        id
    }

    /// The module-level turtle, created on first use.
    pub fn default_turtle(&mut self) -> TurtleId {
        match self.default_turtle {
            Some(id) => id,
            None => {
                let id = self.create_turtle(Some(DEFAULT_SHAPE), true);
                self.default_turtle = Some(id);
                id
            }
        }
    }

    /// Apply to the local copy, then record.
    pub fn emit(&mut self, id: TurtleId, op: Op) {
        let speed = self.default_speed;
        self.turtles
            .entry(id)
            .or_insert_with(|| TurtleState::with_speed(speed))
            .apply(&op);
        self.log.push(Entry::turtle(id, op));
    }

    fn emit_global(&mut self, op: Op) {
        self.log.push(Entry::global(op));
    }

    /// A copy of a turtle's state; unknown ids read as a fresh turtle.
    pub fn state(&self, id: TurtleId) -> TurtleState {
        self.turtles
            .get(&id)
            .cloned()
            .unwrap_or_else(|| TurtleState::with_speed(self.default_speed))
    }

    // -- movement --

    pub fn forward(&mut self, id: TurtleId, distance: f64) {
        self.emit(id, Op::Forward(distance));
    }

    pub fn back(&mut self, id: TurtleId, distance: f64) {
        self.emit(id, Op::Forward(-distance));
    }

    pub fn left(&mut self, id: TurtleId, angle: f64) {
        self.emit(id, Op::Left(angle));
    }

    pub fn right(&mut self, id: TurtleId, angle: f64) {
        self.emit(id, Op::Right(angle));
    }

    pub fn goto(&mut self, id: TurtleId, x: f64, y: f64) {
        self.emit(id, Op::Goto(x, y));
    }

    pub fn setx(&mut self, id: TurtleId, x: f64) {
        let y = self.state(id).pose.y;
        self.goto(id, x, y);
    }

    pub fn sety(&mut self, id: TurtleId, y: f64) {
        let x = self.state(id).pose.x;
        self.goto(id, x, y);
    }

    /// A single left turn by the difference from the current heading.
    pub fn setheading(&mut self, id: TurtleId, to_angle: f64) {
        let diff = to_angle - self.state(id).pose.heading;
        self.left(id, diff);
    }

    pub fn home(&mut self, id: TurtleId) {
        self.goto(id, 0.0, 0.0);
        self.setheading(id, 0.0);
    }

    /// Approximate an arc with `steps` chords of `left(w/2); forward(l); left(w/2)`.
    pub fn circle(&mut self, id: TurtleId, radius: f64, extent: Option<f64>, steps: Option<u32>) {
        let extent = extent.unwrap_or(360.0);
        let steps = steps
            .filter(|s| *s > 0)
            .unwrap_or_else(|| circle_steps(radius, extent))
            .min(MAX_CIRCLE_STEPS);
        let mut w2 = 0.5 * extent / steps as f64;
        let mut l = 2.0 * radius * w2.to_radians().sin();
        if radius < 0.0 {
            l = -l;
            w2 = -w2;
        }
        for _ in 0..steps {
            self.left(id, w2);
            self.forward(id, l);
            self.left(id, w2);
        }
    }

    // -- pen and appearance --

    pub fn penup(&mut self, id: TurtleId) {
        self.emit(id, Op::PenUp);
    }

    pub fn pendown(&mut self, id: TurtleId) {
        self.emit(id, Op::PenDown);
    }

    pub fn pensize(&mut self, id: TurtleId, width: f64) {
        self.emit(id, Op::PenSize(width));
    }

    pub fn color(&mut self, id: TurtleId, pen: &str, fill: &str) {
        self.emit(id, Op::Color(pen.to_string(), fill.to_string()));
    }

    pub fn pencolor(&mut self, id: TurtleId, color: &str) {
        self.emit(id, Op::PenColor(color.to_string()));
    }

    pub fn fillcolor(&mut self, id: TurtleId, color: &str) {
        self.emit(id, Op::FillColor(color.to_string()));
    }

    pub fn speed(&mut self, id: TurtleId, speed: u8) {
        self.emit(id, Op::Speed(speed));
    }

    pub fn shape(&mut self, id: TurtleId, name: &str) {
        self.emit(id, Op::Shape(name.to_string()));
    }

    pub fn showturtle(&mut self, id: TurtleId) {
        self.emit(id, Op::ShowTurtle);
    }

    pub fn hideturtle(&mut self, id: TurtleId) {
        self.emit(id, Op::HideTurtle);
    }

    pub fn begin_fill(&mut self, id: TurtleId) {
        self.emit(id, Op::BeginFill);
    }

    pub fn end_fill(&mut self, id: TurtleId) {
        self.emit(id, Op::EndFill);
    }

    pub fn write(&mut self, id: TurtleId, text: &str, align: &str, font: &str) {
        self.emit(
            id,
            Op::Write {
                text: text.to_string(),
                align: align.to_string(),
                font: font.to_string(),
            },
        );
    }

    pub fn clear(&mut self, id: TurtleId) {
        self.emit(id, Op::Clear);
    }

    pub fn reset(&mut self, id: TurtleId) {
        self.emit(id, Op::Reset);
    }

    // -- screen --

    pub fn bgcolor(&mut self, color: &str) {
        self.bgcolor = color.to_string();
        self.emit_global(Op::Bgcolor(color.to_string()));
    }

    pub fn screen_bgcolor(&self) -> &str {
        &self.bgcolor
    }

    pub fn clear_screen(&mut self) {
        self.emit_global(Op::ClearScreen);
    }

    pub fn bye(&mut self) {
        self.emit_global(Op::Bye);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    fn shim() -> TurtleShim {
        TurtleShim::new(CommandLog::new(), DEFAULT_SPEED)
    }

    #[test]
    fn test_forward_left_forward() {
        let mut s = shim();
        let t = s.create_turtle(None, true);
        s.forward(t, 100.0);
        s.left(t, 90.0);
        s.forward(t, 50.0);
        let pose = s.state(t).pose;
        assert!(approx(pose.x, 100.0));
        assert!(approx(pose.y, 50.0));
        assert!(approx(pose.normalized_heading(), 90.0));
        // create + three moves
        assert_eq!(s.log().len(), 4);
    }

    #[test]
    fn test_create_precedes_other_entries() {
        let mut s = shim();
        let t = s.default_turtle();
        s.forward(t, 10.0);
        let entries = s.log().snapshot();
        assert_eq!(entries[0], Entry::turtle(t, Op::CreateTurtle));
        assert_eq!(s.default_turtle(), t);
    }

    #[test]
    fn test_queries_do_not_log() {
        let mut s = shim();
        let t = s.create_turtle(None, true);
        let before = s.log().len();
        let _ = s.state(t).pose;
        let _ = s.state(t).pen_down;
        assert_eq!(s.log().len(), before);
    }

    #[test]
    fn test_setheading_is_single_left_turn() {
        let mut s = shim();
        let t = s.create_turtle(None, true);
        s.left(t, 30.0);
        s.setheading(t, 270.0);
        let last = s.log().snapshot().pop().unwrap();
        assert_eq!(last.op, Op::Left(240.0));
        assert!(approx(s.state(t).pose.normalized_heading(), 270.0));
    }

    #[test]
    fn test_home_returns_to_origin() {
        let mut s = shim();
        let t = s.create_turtle(None, true);
        s.forward(t, 40.0);
        s.right(t, 45.0);
        s.home(t);
        let pose = s.state(t).pose;
        assert!(approx(pose.x, 0.0) && approx(pose.y, 0.0));
        assert!(approx(pose.normalized_heading(), 0.0));
    }

    #[test]
    fn test_circle_closes_and_step_count() {
        assert_eq!(circle_steps(50.0, 360.0), 1 + (11.0 + 50.0 / 6.0) as u32);
        assert_eq!(circle_steps(1000.0, 360.0), 60);
        assert!(circle_steps(50.0, 90.0) < circle_steps(50.0, 360.0));

        let mut s = shim();
        let t = s.create_turtle(None, true);
        s.circle(t, 50.0, None, None);
        let pose = s.state(t).pose;
        assert!(approx(pose.x, 0.0) && approx(pose.y, 0.0));
        assert!(approx(pose.heading, 360.0));
    }

    #[test]
    fn test_huge_circles_are_capped() {
        assert_eq!(circle_steps(50.0, 1e300), MAX_CIRCLE_STEPS);
        assert_eq!(circle_steps(50.0, f64::INFINITY), MAX_CIRCLE_STEPS);

        let mut s = shim();
        let t = s.create_turtle(None, true);
        let before = s.log().len();
        s.circle(t, 10.0, None, Some(u32::MAX));
        // three entries per chord
        assert_eq!(s.log().len() - before, 3 * MAX_CIRCLE_STEPS as usize);
    }

    #[test]
    fn test_negative_radius_turns_right() {
        let mut s = shim();
        let t = s.create_turtle(None, true);
        s.circle(t, -50.0, Some(180.0), None);
        let pose = s.state(t).pose;
        assert!(approx(pose.x, 0.0));
        assert!(approx(pose.y, -100.0));
    }

    #[test]
    fn test_fill_collects_vertices() {
        let mut state = TurtleState::default();
        state.apply(&Op::BeginFill);
        state.apply(&Op::Forward(10.0));
        state.apply(&Op::Left(90.0));
        state.apply(&Op::Forward(10.0));
        match state.apply(&Op::EndFill) {
            Effect::Fill { vertices, color } => {
                assert_eq!(vertices.len(), 3);
                assert_eq!(color, "black");
            }
            other => panic!("Expected Fill, got {other:?}"),
        }
        assert!(state.fill_path.is_none());
    }

    #[test]
    fn test_pen_up_movement_does_not_stroke() {
        let mut state = TurtleState::default();
        state.apply(&Op::PenUp);
        assert_eq!(state.apply(&Op::Goto(5.0, 5.0)), Effect::None);
        state.apply(&Op::PenDown);
        assert!(matches!(state.apply(&Op::Forward(1.0)), Effect::Stroke { .. }));
    }

    #[test]
    fn test_reset_keeps_speed_and_shape() {
        let mut state = TurtleState::default();
        state.apply(&Op::Speed(2));
        state.apply(&Op::Shape("turtle".into()));
        state.apply(&Op::PenColor("red".into()));
        state.apply(&Op::Forward(30.0));
        state.apply(&Op::Reset);
        assert_eq!(state.pose, Pose::default());
        assert_eq!(state.pen_color, "black");
        assert_eq!(state.speed, 2);
        assert_eq!(state.shape, "turtle");
    }

    #[test]
    fn test_speed_resolution() {
        assert_eq!(speed_from_number(0.0), 0);
        assert_eq!(speed_from_number(11.0), 0);
        assert_eq!(speed_from_number(0.4), 0);
        assert_eq!(speed_from_number(3.6), 4);
        assert_eq!(speed_from_number(0.5), 0);
        assert_eq!(speed_from_number(0.6), 1);
        assert_eq!(speed_from_number(10.4), 10);
        assert_eq!(speed_from_number(10.5), 0);
        assert_eq!(speed_from_number(2.5), 2);
        assert_eq!(speed_from_number(3.5), 4);
        assert_eq!(speed_from_name("slowest"), Some(1));
        assert_eq!(speed_from_name("warp"), None);
    }

    #[test]
    fn test_begin_run_keeps_id_sequence() {
        let mut s = shim();
        let first = s.default_turtle();
        s.begin_run();
        let second = s.default_turtle();
        assert_ne!(first, second);
    }

    #[test]
    fn test_unknown_id_reads_as_default() {
        let mut s = shim();
        s.forward(42, 10.0);
        assert!(approx(s.state(42).pose.x, 10.0));
        assert_eq!(s.state(7).pose, Pose::default());
    }
}
