//! Rotation flavour and table interpretation flags.

use opkit_core::{OpError, Result};

/// Which channels are paired for rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotateStyle {
    /// Pairs `(i, i + r/2)`: the rotated slice is split into two halves.
    #[default]
    Neox = 0,
    /// Pairs `(2i, 2i + 1)`: adjacent channels rotate together.
    GptJ = 1,
}

impl TryFrom<i32> for RotateStyle {
    type Error = OpError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(RotateStyle::Neox),
            1 => Ok(RotateStyle::GptJ),
            other => Err(OpError::argument(
                "rotate_style",
                format!("expected 0 (NEOX) or 1 (GPT-J), got {other}"),
            )),
        }
    }
}

impl RotateStyle {
    /// Channel indices forming pair `j` of a slice of length `rot`.
    #[inline]
    pub fn pair(self, j: usize, rot: usize) -> (usize, usize) {
        match self {
            RotateStyle::Neox => (j, j + rot / 2),
            RotateStyle::GptJ => (2 * j, 2 * j + 1),
        }
    }
}

/// Flags shared by every rotary entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RopeOptions {
    pub style: RotateStyle,
    /// Tables hold `r/2` values per row, expanded to `r` according to `style`.
    pub reuse_freqs_front_part: bool,
    /// The untouched `d - r` channels precede the rotated ones.
    pub nope_first: bool,
}

impl RopeOptions {
    pub fn new(style: RotateStyle) -> Self {
        Self {
            style,
            ..Self::default()
        }
    }

    /// Builds options from the integer style code used by serialized configs.
    pub fn from_raw(rotate_style: i32, reuse_freqs_front_part: bool, nope_first: bool) -> Result<Self> {
        Ok(Self {
            style: RotateStyle::try_from(rotate_style)?,
            reuse_freqs_front_part,
            nope_first,
        })
    }

    pub fn reuse_freqs_front_part(mut self, reuse: bool) -> Self {
        self.reuse_freqs_front_part = reuse;
        self
    }

    pub fn nope_first(mut self, nope_first: bool) -> Self {
        self.nope_first = nope_first;
        self
    }

    /// Rotated width implied by a table whose last dim is `table_width`.
    pub fn rotary_width(&self, table_width: usize) -> usize {
        if self.reuse_freqs_front_part {
            table_width * 2
        } else {
            table_width
        }
    }

    /// Start of the rotated slice inside a head vector of `head_dim` channels.
    pub fn rotary_offset(&self, head_dim: usize, rot: usize) -> usize {
        if self.nope_first {
            head_dim - rot
        } else {
            0
        }
    }
}

/// Checks that a rotated width fits the head vector and pairs up evenly.
pub fn validate_rotary_width(rot: usize, head_dim: usize) -> Result<()> {
    if rot == 0 || rot % 2 != 0 {
        return Err(OpError::shape(format!(
            "rotated width must be a positive even number, got {rot}"
        )));
    }
    if rot > head_dim {
        return Err(OpError::shape(format!(
            "rotated width {rot} exceeds head dim {head_dim}"
        )));
    }
    Ok(())
}
