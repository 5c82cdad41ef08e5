use std::collections::BTreeMap;
use std::f64::consts::PI;

use crate::command_log::{Entry, Op, TurtleId};
use crate::turtle::{Effect, Pose, TurtleState};

/// Render target for playback. Coordinates are raster pixels (origin top
/// left, y down). The ink layer persists; `compose` redraws the visible
/// canvas from ink plus avatars.
pub trait Surface {
    fn size(&self) -> (f64, f64);
    fn paint_background(&mut self, color: &str);
    fn stroke(&mut self, from: (f64, f64), to: (f64, f64), color: &str, width: f64);
    fn fill(&mut self, polygon: &[(f64, f64)], color: &str);
    fn text(&mut self, at: (f64, f64), text: &str, align: &str, font: &str, color: &str);
    fn compose(&mut self, avatars: &[Avatar]);
}

/// World coordinates (origin centre, y up) to raster coordinates.
pub fn to_raster(x: f64, y: f64, width: f64, height: f64) -> (f64, f64) {
    (x + width / 2.0, height / 2.0 - y)
}

/// Canvas colour before any `bgcolor` and after `clearscreen`.
pub const DEFAULT_BACKGROUND: &str = "white";

// ----------------------------------------------------------------------------
// Avatars
// ----------------------------------------------------------------------------

/// A turtle's on-screen marker, already placed and rotated.
#[derive(Debug, Clone, PartialEq)]
pub struct Avatar {
    pub turtle: TurtleId,
    /// Closed outline in raster coordinates.
    pub outline: Vec<(f64, f64)>,
    pub pen_color: String,
    pub fill_color: String,
}

/// Shape outline in the turtle's local frame: +x is the heading, +y its left.
fn shape_outline(shape: &str) -> Vec<(f64, f64)> {
    match shape {
        "circle" => (0..20)
            .map(|i| {
                let a = i as f64 * 2.0 * PI / 20.0;
                (10.0 * a.cos(), 10.0 * a.sin())
            })
            .collect(),
        "square" => vec![(10.0, 10.0), (-10.0, 10.0), (-10.0, -10.0), (10.0, -10.0)],
        "triangle" => vec![(11.55, 0.0), (-5.77, 10.0), (-5.77, -10.0)],
        "turtle" => vec![
            (16.0, 0.0),
            (14.0, 2.0),
            (10.0, 1.0),
            (7.0, 4.0),
            (9.0, 7.0),
            (8.0, 9.0),
            (5.0, 6.0),
            (1.0, 7.0),
            (-3.0, 5.0),
            (-6.0, 8.0),
            (-8.0, 6.0),
            (-5.0, 4.0),
            (-7.0, 0.0),
            (-5.0, -4.0),
            (-8.0, -6.0),
            (-6.0, -8.0),
            (-3.0, -5.0),
            (1.0, -7.0),
            (5.0, -6.0),
            (8.0, -9.0),
            (9.0, -7.0),
            (7.0, -4.0),
            (10.0, -1.0),
            (14.0, -2.0),
        ],
        "arrow" => vec![(10.0, 0.0), (0.0, 10.0), (0.0, -10.0)],
        // classic
        _ => vec![(0.0, 0.0), (-9.0, 5.0), (-7.0, 0.0), (-9.0, -5.0)],
    }
}

fn avatar(id: TurtleId, state: &TurtleState, width: f64, height: f64) -> Avatar {
    let Pose { x, y, heading } = state.pose;
    let (sin, cos) = heading.to_radians().sin_cos();
    let outline = shape_outline(&state.shape)
        .into_iter()
        .map(|(lx, ly)| to_raster(x + lx * cos - ly * sin, y + lx * sin + ly * cos, width, height))
        .collect();
    Avatar {
        turtle: id,
        outline,
        pen_color: state.pen_color.clone(),
        fill_color: state.fill_color.clone(),
    }
}

// ----------------------------------------------------------------------------
// Player
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Playback {
    Playing,
    Finished,
}

/// Replays a command log frame by frame with its own copy of every turtle.
#[derive(Debug)]
pub struct Player {
    entries: Vec<Entry>,
    cursor: usize,
    turtles: BTreeMap<TurtleId, TurtleState>,
    default_speed: u8,
    background: String,
    started: bool,
}

impl Player {
    pub fn new(entries: Vec<Entry>, default_speed: u8) -> Self {
        Self {
            entries,
            cursor: 0,
            turtles: BTreeMap::new(),
            default_speed,
            background: DEFAULT_BACKGROUND.into(),
            started: false,
        }
    }

    pub fn remaining(&self) -> usize {
        self.entries.len() - self.cursor
    }

    pub fn is_finished(&self) -> bool {
        self.cursor >= self.entries.len()
    }

    pub fn turtle(&self, id: TurtleId) -> Option<&TurtleState> {
        self.turtles.get(&id)
    }

    /// Entries the next frame will execute: the owning turtle's speed, every
    /// remaining entry at speed 0, and one for global or unknown owners.
    pub fn batch_size(&self) -> usize {
        let Some(next) = self.entries.get(self.cursor) else {
            return 0;
        };
        let speed = next
            .owner
            .filter(|_| next.op != Op::CreateTurtle)
            .and_then(|id| self.turtles.get(&id))
            .map(|t| t.speed);
        match speed {
            Some(0) => self.remaining(),
            Some(n) => (n as usize).min(self.remaining()),
            None => 1,
        }
    }

    /// Execute one batch and composite. `Finished` once the log is exhausted;
    /// the caller stops scheduling frames then.
    pub fn frame(&mut self, surface: &mut impl Surface) -> Playback {
        if !self.started {
            surface.paint_background(&self.background);
            self.started = true;
        }
        let batch = self.batch_size();
        for _ in 0..batch {
            let entry = self.entries[self.cursor].clone();
            self.cursor += 1;
            self.execute(&entry, surface);
        }
        log::debug!("playback frame: {batch} entries, {} left", self.remaining());
        let avatars = self.avatars(surface.size());
        surface.compose(&avatars);
        if self.is_finished() {
            Playback::Finished
        } else {
            Playback::Playing
        }
    }

    /// Play everything that is left in one go.
    pub fn finish(&mut self, surface: &mut impl Surface) {
        while self.frame(surface) == Playback::Playing {}
    }

    fn execute(&mut self, entry: &Entry, surface: &mut impl Surface) {
        let (width, height) = surface.size();
        let Some(id) = entry.owner else {
            match &entry.op {
                Op::Bgcolor(color) => {
                    self.background = color.clone();
                    surface.paint_background(color);
                }
                Op::ClearScreen => {
                    self.background = DEFAULT_BACKGROUND.into();
                    surface.paint_background(DEFAULT_BACKGROUND);
                }
                _ => {}
            }
            return;
        };
        let default_speed = self.default_speed;
        if entry.op == Op::CreateTurtle {
            self.turtles.insert(id, TurtleState::with_speed(default_speed));
            return;
        }
        let state = self
            .turtles
            .entry(id)
            .or_insert_with(|| TurtleState::with_speed(default_speed));
        let map = |(x, y): (f64, f64)| to_raster(x, y, width, height);
        match state.apply(&entry.op) {
            Effect::None => {}
            Effect::Stroke {
                from,
                to,
                color,
                width: pen,
            } => surface.stroke(map(from), map(to), &color, pen),
            Effect::Fill { vertices, color } => {
                let polygon: Vec<_> = vertices.into_iter().map(map).collect();
                surface.fill(&polygon, &color);
            }
            Effect::Text {
                at,
                text,
                align,
                font,
                color,
            } => surface.text(map(at), &text, &align, &font, &color),
        }
    }

    fn avatars(&self, (width, height): (f64, f64)) -> Vec<Avatar> {
        self.turtles
            .iter()
            .filter(|(_, t)| t.visible)
            .map(|(id, t)| avatar(*id, t, width, height))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_log::CommandLog;
    use crate::turtle::{DEFAULT_SPEED, TurtleShim};

    #[derive(Debug, PartialEq)]
    enum Call {
        Background(String),
        Stroke((f64, f64), (f64, f64)),
        Fill(usize),
        Text(String),
        Compose(usize),
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<Call>,
    }

    impl Surface for Recorder {
        fn size(&self) -> (f64, f64) {
            (600.0, 400.0)
        }
        fn paint_background(&mut self, color: &str) {
            self.calls.push(Call::Background(color.into()));
        }
        fn stroke(&mut self, from: (f64, f64), to: (f64, f64), _: &str, _: f64) {
            self.calls.push(Call::Stroke(from, to));
        }
        fn fill(&mut self, polygon: &[(f64, f64)], _: &str) {
            self.calls.push(Call::Fill(polygon.len()));
        }
        fn text(&mut self, _: (f64, f64), text: &str, _: &str, _: &str, _: &str) {
            self.calls.push(Call::Text(text.into()));
        }
        fn compose(&mut self, avatars: &[Avatar]) {
            self.calls.push(Call::Compose(avatars.len()));
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_to_raster() {
        assert_eq!(to_raster(0.0, 0.0, 600.0, 400.0), (300.0, 200.0));
        assert_eq!(to_raster(100.0, 50.0, 600.0, 400.0), (400.0, 150.0));
    }

    #[test]
    fn test_speed_zero_replay_position() {
        let entries = vec![
            Entry::turtle(0, Op::CreateTurtle),
            Entry::turtle(0, Op::Speed(0)),
            Entry::turtle(0, Op::Forward(100.0)),
            Entry::turtle(0, Op::Left(90.0)),
            Entry::turtle(0, Op::Forward(50.0)),
        ];
        let mut player = Player::new(entries, DEFAULT_SPEED);
        let mut surface = Recorder::default();
        player.finish(&mut surface);
        let pose = player.turtle(0).unwrap().pose;
        assert!(approx(pose.x, 100.0));
        assert!(approx(pose.y, 50.0));
        assert!(approx(pose.normalized_heading(), 90.0));
    }

    #[test]
    fn test_speed_zero_drains_in_one_frame() {
        let mut entries = vec![
            Entry::turtle(0, Op::CreateTurtle),
            Entry::turtle(0, Op::Speed(0)),
        ];
        entries.extend((0..500).map(|_| Entry::turtle(0, Op::Forward(1.0))));
        let mut player = Player::new(entries, DEFAULT_SPEED);
        let mut surface = Recorder::default();
        assert_eq!(player.frame(&mut surface), Playback::Playing); // create
        // speed change runs at the old speed, taking five moves with it
        assert_eq!(player.frame(&mut surface), Playback::Playing);
        assert_eq!(player.remaining(), 495);
        assert_eq!(player.frame(&mut surface), Playback::Finished);
        assert_eq!(player.remaining(), 0);
    }

    #[test]
    fn test_speed_n_processes_n_per_frame() {
        let mut entries = vec![Entry::turtle(0, Op::CreateTurtle)];
        entries.extend((0..10).map(|_| Entry::turtle(0, Op::Left(1.0))));
        let mut player = Player::new(entries, 3);
        let mut surface = Recorder::default();
        player.frame(&mut surface);
        assert_eq!(player.remaining(), 10);
        assert_eq!(player.batch_size(), 3);
        player.frame(&mut surface);
        assert_eq!(player.remaining(), 7);
        player.frame(&mut surface);
        player.frame(&mut surface);
        assert_eq!(player.remaining(), 1);
        assert_eq!(player.batch_size(), 1);
    }

    #[test]
    fn test_unknown_owner_and_globals_batch_one() {
        let entries = vec![
            Entry::global(Op::Bgcolor("black".into())),
            Entry::turtle(9, Op::Forward(10.0)),
            Entry::turtle(9, Op::Forward(10.0)),
        ];
        let mut player = Player::new(entries, DEFAULT_SPEED);
        let mut surface = Recorder::default();
        assert_eq!(player.batch_size(), 1);
        player.frame(&mut surface);
        assert_eq!(player.batch_size(), 1);
        player.frame(&mut surface);
        // the synthesised turtle now has the default speed
        assert_eq!(player.batch_size(), 1);
        player.finish(&mut surface);
        assert!(approx(player.turtle(9).unwrap().pose.x, 20.0));
        assert!(surface.calls.contains(&Call::Background("black".into())));
    }

    #[test]
    fn test_pen_down_moves_stroke_ink() {
        let entries = vec![
            Entry::turtle(0, Op::CreateTurtle),
            Entry::turtle(0, Op::Forward(100.0)),
            Entry::turtle(0, Op::PenUp),
            Entry::turtle(0, Op::Goto(0.0, 0.0)),
            Entry::turtle(0, Op::PenDown),
            Entry::turtle(0, Op::Goto(0.0, 100.0)),
        ];
        let mut player = Player::new(entries, DEFAULT_SPEED);
        let mut surface = Recorder::default();
        player.finish(&mut surface);
        let strokes: Vec<&Call> = surface
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Stroke(..)))
            .collect();
        assert_eq!(
            strokes,
            vec![
                &Call::Stroke((300.0, 200.0), (400.0, 200.0)),
                &Call::Stroke((300.0, 200.0), (300.0, 100.0)),
            ]
        );
    }

    #[test]
    fn test_clear_screen_resets_to_white() {
        let entries = vec![
            Entry::global(Op::Bgcolor("navy".into())),
            Entry::global(Op::ClearScreen),
        ];
        let mut player = Player::new(entries, DEFAULT_SPEED);
        let mut surface = Recorder::default();
        player.finish(&mut surface);
        let backgrounds: Vec<&Call> = surface
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Background(_)))
            .collect();
        assert_eq!(backgrounds.len(), 3);
        assert_eq!(backgrounds[1], &Call::Background("navy".into()));
        assert_eq!(backgrounds[2], &Call::Background("white".into()));
    }

    #[test]
    fn test_fill_and_text_reach_surface() {
        let entries = vec![
            Entry::turtle(0, Op::CreateTurtle),
            Entry::turtle(0, Op::Speed(0)),
            Entry::turtle(0, Op::BeginFill),
            Entry::turtle(0, Op::Forward(10.0)),
            Entry::turtle(0, Op::Left(120.0)),
            Entry::turtle(0, Op::Forward(10.0)),
            Entry::turtle(0, Op::EndFill),
            Entry::turtle(
                0,
                Op::Write {
                    text: "done".into(),
                    align: "left".into(),
                    font: "normal 8px Arial".into(),
                },
            ),
        ];
        let mut player = Player::new(entries, DEFAULT_SPEED);
        let mut surface = Recorder::default();
        player.finish(&mut surface);
        assert!(surface.calls.contains(&Call::Fill(3)));
        assert!(surface.calls.contains(&Call::Text("done".into())));
    }

    #[test]
    fn test_hidden_turtles_have_no_avatar() {
        let entries = vec![
            Entry::turtle(0, Op::CreateTurtle),
            Entry::turtle(1, Op::CreateTurtle),
            Entry::turtle(1, Op::HideTurtle),
        ];
        let mut player = Player::new(entries, DEFAULT_SPEED);
        let mut surface = Recorder::default();
        player.finish(&mut surface);
        assert_eq!(surface.calls.last(), Some(&Call::Compose(1)));
    }

    #[test]
    fn test_avatar_rotates_with_heading() {
        let mut state = TurtleState::default();
        state.shape = "arrow".into();
        state.apply(&Op::Left(90.0));
        let a = avatar(0, &state, 600.0, 400.0);
        // the tip points up the screen
        assert!(approx(a.outline[0].0, 300.0));
        assert!(approx(a.outline[0].1, 190.0));
    }

    #[test]
    fn test_replay_converges_with_shim() {
        let mut shim = TurtleShim::new(CommandLog::new(), DEFAULT_SPEED);
        let a = shim.create_turtle(None, true);
        let b = shim.create_turtle(Some("turtle"), true);
        shim.circle(a, 40.0, Some(270.0), None);
        shim.goto(b, -30.0, 12.5);
        shim.right(b, 33.0);
        shim.forward(b, 71.0);
        shim.home(a);
        shim.setheading(b, 200.0);
        shim.back(b, 9.0);

        let mut player = Player::new(shim.log().snapshot(), DEFAULT_SPEED);
        player.finish(&mut Recorder::default());
        for id in [a, b] {
            let expected = shim.state(id).pose;
            let actual = player.turtle(id).unwrap().pose;
            assert!(approx(expected.x, actual.x));
            assert!(approx(expected.y, actual.y));
            assert!(approx(expected.heading, actual.heading));
        }
    }
}
