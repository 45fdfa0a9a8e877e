//! Terminal renderer for a complete k-ary process tree.
//!
//! Produces one frame as a `String`; callers decide when to clear the
//! screen and print it. Each node is drawn as `[P:i]` above its thread
//! tokens `T0 T1 ...`, centered over the span of its descendants. The
//! active thread is highlighted.

use std::fmt::Write as _;

pub const RESET: &str = "\x1b[0m";
pub const RED: &str = "\x1b[31m";
pub const GREEN: &str = "\x1b[32m";
pub const YELLOW: &str = "\x1b[33m";
pub const CYAN: &str = "\x1b[36m";
pub const BOLD: &str = "\x1b[1m";
/// Clear screen and move the cursor home.
pub const CLEAR_HOME: &str = "\x1b[2J\x1b[H";

/// Shape of the tree being drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    pub depth: usize,
    pub fanout: usize,
    pub threads: usize,
}

impl Shape {
    /// Number of nodes in layer `layer`.
    pub fn layer_len(&self, layer: usize) -> usize {
        self.fanout.pow(layer as u32)
    }

    /// Index of the first node of `layer` (breadth-first numbering).
    pub fn layer_start(&self, layer: usize) -> usize {
        (0..layer).map(|l| self.layer_len(l)).sum()
    }

    pub fn nodes(&self) -> usize {
        self.layer_start(self.depth)
    }
}

/// The node and thread currently holding the shared region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Active {
    pub node: usize,
    pub thread: usize,
}

/// A line under construction: text plus its visible width.
struct Line {
    text: String,
    col: usize,
}

impl Line {
    fn new() -> Self {
        Self { text: String::new(), col: 0 }
    }

    fn pad_to(&mut self, col: usize) {
        while self.col < col {
            self.text.push(' ');
            self.col += 1;
        }
    }

    fn push(&mut self, visible: &str, style: Option<&str>, color: bool) {
        match style {
            Some(code) if color => {
                self.text.push_str(code);
                self.text.push_str(visible);
                self.text.push_str(RESET);
            }
            _ => self.text.push_str(visible),
        }
        self.col += visible.chars().count();
    }
}

fn thread_tokens(shape: &Shape, node: usize, active: Option<Active>, color: bool) -> (usize, Line) {
    let mut line = Line::new();
    for t in 0..shape.threads {
        if t > 0 {
            line.push(" ", None, color);
        }
        let token = format!("T{}", t);
        let hot = active == Some(Active { node, thread: t });
        if hot && !color {
            line.push(&format!("*{}", token), None, color);
        } else {
            line.push(&token, hot.then_some(RED), color);
        }
    }
    (line.col, line)
}

/// Render one frame.
pub fn render(shape: &Shape, active: Option<Active>, color: bool) -> String {
    let cell = (shape.threads * 3).max(8) + 2;
    let leaves = shape.layer_len(shape.depth.saturating_sub(1)).max(1);
    let width = leaves * cell + 12;
    let rule: String = "═".repeat(width);

    let mut out = String::new();
    let border = |s: &str| if color { format!("{}{}{}", CYAN, s, RESET) } else { s.to_string() };
    let _ = writeln!(out, "{}", border(&format!("╔{}╗", rule)));
    let _ = writeln!(out, "{} {}", border("║"), if color { format!("{}PROCESS TREE{}", BOLD, RESET) } else { "PROCESS TREE".into() });
    let _ = writeln!(out, "{}", border(&format!("╠{}╣", rule)));

    for layer in 0..shape.depth {
        let span = cell * leaves / shape.layer_len(layer);
        let first = shape.layer_start(layer);

        let mut heads = Line::new();
        let mut tokens = Line::new();
        heads.push("  ", None, color);
        heads.push(&format!("Layer {}:", layer), Some(YELLOW), color);
        tokens.pad_to(heads.col);
        let base = heads.col + 2;

        for pos in 0..shape.layer_len(layer) {
            let node = first + pos;
            let center = base + pos * span + span / 2;
            let label = format!("[P:{}]", node);
            heads.pad_to(center.saturating_sub(label.len() / 2).max(heads.col + 1));
            heads.push(&label, Some(BOLD), color);

            let (len, line) = thread_tokens(shape, node, active, color);
            tokens.pad_to(center.saturating_sub(len / 2).max(tokens.col + 1));
            tokens.text.push_str(&line.text);
            tokens.col += line.col;
        }
        let _ = writeln!(out, "{}{}", border("║"), heads.text);
        let _ = writeln!(out, "{}{}", border("║"), tokens.text);
        if layer + 1 < shape.depth {
            let mut links = Line::new();
            for pos in 0..shape.layer_len(layer) {
                links.pad_to(base + pos * span + span / 2);
                links.push("|", None, color);
            }
            let _ = writeln!(out, "{}{}", border("║"), links.text);
        }
    }

    let _ = writeln!(out, "{}", border(&format!("╠{}╣", rule)));
    let active_text = match active {
        Some(a) => format!("P:{} T:{}", a.node, a.thread),
        None => String::from("-"),
    };
    let mut footer = Line::new();
    footer.push("  ", None, color);
    footer.push("Active:", Some(GREEN), color);
    footer.push(" ", None, color);
    footer.push(&active_text, Some(RED), color);
    let _ = writeln!(
        out,
        "{}{}  │  {} processes × {} threads = {} threads",
        border("║"),
        footer.text,
        shape.nodes(),
        shape.threads,
        shape.nodes() * shape.threads
    );
    let _ = writeln!(out, "{}  Press Ctrl+C to stop", border("║"));
    let _ = writeln!(out, "{}", border(&format!("╚{}╝", rule)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHAPE: Shape = Shape { depth: 3, fanout: 2, threads: 3 };

    #[test]
    fn shape_numbering() {
        assert_eq!(SHAPE.nodes(), 7);
        assert_eq!(SHAPE.layer_start(2), 3);
        assert_eq!(SHAPE.layer_len(2), 4);
    }

    #[test]
    fn plain_frame_lists_every_node_and_marks_active() {
        let frame = render(&SHAPE, Some(Active { node: 5, thread: 1 }), false);
        for node in 0..7 {
            assert!(frame.contains(&format!("[P:{}]", node)), "missing node {}", node);
        }
        assert_eq!(frame.matches("*T1").count(), 1);
        assert!(frame.contains("Active: P:5 T:1"));
        assert!(frame.contains("7 processes × 3 threads = 21 threads"));
        assert!(!frame.contains('\x1b'));
    }

    #[test]
    fn colored_frame_highlights_in_red() {
        let frame = render(&SHAPE, Some(Active { node: 0, thread: 0 }), true);
        assert!(frame.contains(&format!("{}T0{}", RED, RESET)));
    }
}
