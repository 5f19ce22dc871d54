//! NAS Search Space Definition
//!
//! Encodes the decision space of one cell built from `B` blocks and converts
//! between flat token sequences and structured cell descriptions.
//!
//! Each block picks `inputs_per_block` (input, operator) pairs. The tokens of
//! block `i` are laid out as `[input_1, op_1, input_2, op_2, ...]`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::config::SpaceConfig;
use crate::error::{KolosalError, Result};

/// Computation primitive usable inside a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Operator {
    /// Depthwise convolution of the given width
    DepthwiseConv { kernel: usize },
    /// Two stacked convolutions of the given width (`1xk` then `kx1`)
    FactorizedConv { kernel: usize },
    /// Max pooling, stride 1
    MaxPool { width: usize },
    /// Average pooling, stride 1
    AvgPool { width: usize },
    /// Pass-through
    Identity,
}

impl Operator {
    /// Operators searched by default
    pub fn default_catalog() -> Vec<Self> {
        vec![
            Self::DepthwiseConv { kernel: 3 },
            Self::DepthwiseConv { kernel: 5 },
            Self::DepthwiseConv { kernel: 7 },
            Self::FactorizedConv { kernel: 7 },
            Self::MaxPool { width: 3 },
            Self::AvgPool { width: 3 },
        ]
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DepthwiseConv { kernel } => write!(f, "{k}x{k} dconv", k = kernel),
            Self::FactorizedConv { kernel } => write!(f, "1x{k}-{k}x1 conv", k = kernel),
            Self::MaxPool { width } => write!(f, "{w}x{w} maxpool", w = width),
            Self::AvgPool { width } => write!(f, "{w}x{w} avgpool", w = width),
            Self::Identity => write!(f, "identity"),
        }
    }
}

fn parse_square(dims: &str) -> Option<usize> {
    let (a, b) = dims.split_once('x')?;
    let a: usize = a.parse().ok()?;
    let b: usize = b.parse().ok()?;
    (a == b && a % 2 == 1).then_some(a)
}

impl FromStr for Operator {
    type Err = KolosalError;

    fn from_str(s: &str) -> Result<Self> {
        let label = s.trim().to_lowercase();
        if label == "identity" {
            return Ok(Self::Identity);
        }

        let parsed = label.split_once(' ').and_then(|(dims, kind)| match kind {
            "dconv" => parse_square(dims).map(|kernel| Self::DepthwiseConv { kernel }),
            "maxpool" => parse_square(dims).map(|width| Self::MaxPool { width }),
            "avgpool" => parse_square(dims).map(|width| Self::AvgPool { width }),
            "conv" => {
                // 1xk-kx1
                let (first, second) = dims.split_once('-')?;
                let k1: usize = first.strip_prefix("1x")?.parse().ok()?;
                let k2: usize = second.strip_suffix("x1")?.parse().ok()?;
                (k1 == k2 && k1 % 2 == 1).then_some(Self::FactorizedConv { kernel: k1 })
            }
            _ => None,
        });

        parsed.ok_or_else(|| KolosalError::ConfigError(format!("Unknown operator '{}'", s)))
    }
}

impl TryFrom<String> for Operator {
    type Error = KolosalError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Operator> for String {
    fn from(op: Operator) -> Self {
        op.to_string()
    }
}

/// Source of one block input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputRef {
    /// Cell input `j` steps back (0 = immediate input)
    External(usize),
    /// Output of an earlier block of the same cell
    Block(usize),
}

impl InputRef {
    /// Signed value used in logs: `-1, -2, ...` for external inputs and the
    /// block index otherwise
    pub fn value(&self) -> i64 {
        match *self {
            Self::External(j) => -(j as i64) - 1,
            Self::Block(b) => b as i64,
        }
    }
}

impl fmt::Display for InputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// One (input, operator) pair of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockChoice {
    pub input: InputRef,
    pub op: Operator,
}

/// A decoded block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block index within the cell
    pub index: usize,
    /// Selected inputs and their operators; outputs are summed
    pub choices: Vec<BlockChoice>,
}

/// Decoded cell description
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellArchitecture {
    pub blocks: Vec<Block>,
}

impl CellArchitecture {
    /// Number of decided blocks
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Flat decision values, one per token: input values then operator labels
    pub fn decision_values(&self) -> Vec<String> {
        self.blocks
            .iter()
            .flat_map(|block| block.choices.iter())
            .flat_map(|choice| [choice.input.to_string(), choice.op.to_string()])
            .collect()
    }

    /// Largest external lookback referenced by any block
    pub fn max_lookback(&self) -> usize {
        self.blocks
            .iter()
            .flat_map(|b| b.choices.iter())
            .filter_map(|c| match c.input {
                InputRef::External(j) => Some(j),
                InputRef::Block(_) => None,
            })
            .max()
            .unwrap_or(0)
    }
}

impl fmt::Display for CellArchitecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.decision_values().join(", "))
    }
}

/// Kind of atomic decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionKind {
    /// Input selection
    Input,
    /// Operator selection
    Operator,
}

/// One token position of the decision sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionSlot {
    pub position: usize,
    pub block: usize,
    pub kind: DecisionKind,
    pub cardinality: usize,
}

/// NAS search space of a single progressively built cell
#[derive(Debug, Clone)]
pub struct StateSpace {
    num_blocks: usize,
    operators: Vec<Operator>,
    inputs_per_block: usize,
    lookback_depth: usize,
    lookforward_depth: Option<usize>,
}

impl StateSpace {
    /// Create a search space, validating the configuration
    pub fn new(config: &SpaceConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            num_blocks: config.num_blocks,
            operators: config.operators.clone(),
            inputs_per_block: config.inputs_per_block,
            lookback_depth: config.lookback_depth,
            lookforward_depth: config.lookforward_depth,
        })
    }

    /// Number of blocks `B`
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Operator catalog
    pub fn operators(&self) -> &[Operator] {
        &self.operators
    }

    /// Number of operator choices
    pub fn num_operators(&self) -> usize {
        self.operators.len()
    }

    /// Number of (input, operator) pairs per block
    pub fn inputs_per_block(&self) -> usize {
        self.inputs_per_block
    }

    /// Tokens emitted per block
    pub fn tokens_per_block(&self) -> usize {
        2 * self.inputs_per_block
    }

    /// Tokens of a complete cell
    pub fn max_sequence_len(&self) -> usize {
        self.num_blocks * self.tokens_per_block()
    }

    /// External inputs visible to every block
    pub fn num_external_inputs(&self) -> usize {
        1 + self.lookback_depth
    }

    /// Largest input cardinality over all blocks
    pub fn max_input_cardinality(&self) -> usize {
        (0..self.num_blocks)
            .map(|b| self.input_cardinality(b))
            .max()
            .unwrap_or(1)
    }

    fn first_visible_block(&self, block: usize) -> usize {
        self.lookforward_depth
            .map(|depth| block.saturating_sub(depth))
            .unwrap_or(0)
    }

    /// Input sources available to a block, in token order
    pub fn input_sources(&self, block: usize) -> Vec<InputRef> {
        (0..self.num_external_inputs())
            .map(InputRef::External)
            .chain((self.first_visible_block(block)..block).map(InputRef::Block))
            .collect()
    }

    /// Number of input choices of a block
    pub fn input_cardinality(&self, block: usize) -> usize {
        self.num_external_inputs() + block - self.first_visible_block(block)
    }

    /// Decision slot of a token position
    pub fn slot(&self, position: usize) -> DecisionSlot {
        let block = position / self.tokens_per_block();
        let (kind, cardinality) = if (position % self.tokens_per_block()) % 2 == 0 {
            (DecisionKind::Input, self.input_cardinality(block))
        } else {
            (DecisionKind::Operator, self.num_operators())
        };
        DecisionSlot { position, block, kind, cardinality }
    }

    /// Number of legal tokens at a position
    pub fn cardinality(&self, position: usize) -> usize {
        self.slot(position).cardinality
    }

    /// Every decision of a full cell with its cardinality
    pub fn describe_space(&self) -> Vec<DecisionSlot> {
        (0..self.max_sequence_len()).map(|p| self.slot(p)).collect()
    }

    /// Distinct token groups for one block
    pub fn block_branching(&self, block: usize) -> u128 {
        let pair = (self.input_cardinality(block) * self.num_operators()) as u128;
        (0..self.inputs_per_block).fold(1u128, |acc, _| acc.saturating_mul(pair))
    }

    /// Sequences reachable after `trial` when at most `k` prefixes survive
    /// each trial (`None` = no filtering)
    pub fn reachable_at(&self, trial: usize, k: Option<usize>) -> u128 {
        let mut count = self.block_branching(0);
        for block in 1..=trial.min(self.num_blocks.saturating_sub(1)) {
            let survivors = match k {
                Some(k) => count.min(k as u128),
                None => count,
            };
            count = survivors.saturating_mul(self.block_branching(block));
        }
        count
    }

    /// Distinct full architectures reachable with top-`k` widening
    pub fn total_combinations(&self, k: Option<usize>) -> u128 {
        self.reachable_at(self.num_blocks.saturating_sub(1), k)
    }

    /// Number of candidates trained over a whole run
    pub fn total_models(&self, k: usize, max_enumerable: usize) -> u128 {
        let first = self.block_branching(0);
        let mut proposals = if first <= max_enumerable as u128 {
            first
        } else {
            first.min(k as u128)
        };
        let mut total = proposals;
        for block in 1..self.num_blocks {
            let prefixes = proposals.min(k as u128);
            proposals = prefixes
                .saturating_mul(self.block_branching(block))
                .min(k as u128);
            total = total.saturating_add(proposals);
        }
        total
    }

    /// Check every token against its position
    pub fn validate(&self, tokens: &[usize]) -> Result<()> {
        let tpb = self.tokens_per_block();
        if tokens.len() % tpb != 0 || tokens.len() > self.max_sequence_len() {
            return Err(KolosalError::InvalidSequenceLength {
                length: tokens.len(),
                tokens_per_block: tpb,
                max_blocks: self.num_blocks,
            });
        }
        for (position, &token) in tokens.iter().enumerate() {
            let cardinality = self.cardinality(position);
            if token >= cardinality {
                return Err(KolosalError::InvalidToken { position, token, cardinality });
            }
        }
        Ok(())
    }

    /// Decode a token sequence into a cell description
    pub fn decode(&self, tokens: &[usize]) -> Result<CellArchitecture> {
        self.validate(tokens)?;

        let blocks = tokens
            .chunks(self.tokens_per_block())
            .enumerate()
            .map(|(index, group)| {
                let sources = self.input_sources(index);
                let choices = group
                    .chunks(2)
                    .map(|pair| BlockChoice {
                        input: sources[pair[0]],
                        op: self.operators[pair[1]],
                    })
                    .collect();
                Block { index, choices }
            })
            .collect();

        Ok(CellArchitecture { blocks })
    }

    /// Encode a cell description back into tokens
    pub fn encode(&self, arch: &CellArchitecture) -> Result<Vec<usize>> {
        if arch.blocks.len() > self.num_blocks {
            return Err(KolosalError::InvalidSequenceLength {
                length: arch.blocks.len() * self.tokens_per_block(),
                tokens_per_block: self.tokens_per_block(),
                max_blocks: self.num_blocks,
            });
        }

        let mut tokens = Vec::with_capacity(arch.blocks.len() * self.tokens_per_block());
        for (index, block) in arch.blocks.iter().enumerate() {
            if block.choices.len() != self.inputs_per_block {
                return Err(KolosalError::DataError(format!(
                    "Block {} has {} inputs, expected {}",
                    index,
                    block.choices.len(),
                    self.inputs_per_block
                )));
            }
            let sources = self.input_sources(index);
            for choice in &block.choices {
                let input = sources.iter().position(|s| *s == choice.input).ok_or_else(|| {
                    KolosalError::DataError(format!(
                        "Block {} cannot read from input {}",
                        index, choice.input
                    ))
                })?;
                let op = self.operators.iter().position(|o| *o == choice.op).ok_or_else(|| {
                    KolosalError::DataError(format!("Operator '{}' is not in the catalog", choice.op))
                })?;
                tokens.push(input);
                tokens.push(op);
            }
        }
        Ok(tokens)
    }

    /// Every legal extension of `prefix` by the given block
    pub fn enumerate_block(&self, block: usize, prefix: &[usize]) -> Vec<Vec<usize>> {
        let start = block * self.tokens_per_block();
        let cardinalities: Vec<usize> = (start..start + self.tokens_per_block())
            .map(|p| self.cardinality(p))
            .collect();

        let mut sequences = vec![prefix.to_vec()];
        for &cardinality in &cardinalities {
            sequences = sequences
                .into_iter()
                .flat_map(|seq| {
                    (0..cardinality).map(move |token| {
                        let mut next = seq.clone();
                        next.push(token);
                        next
                    })
                })
                .collect();
        }
        sequences
    }

    /// Human readable summary of the decision space
    pub fn summary(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "{} blocks, {} inputs per block, {} external inputs",
            self.num_blocks,
            self.inputs_per_block,
            self.num_external_inputs()
        )];
        for block in 0..self.num_blocks {
            let sources: Vec<String> = self.input_sources(block).iter().map(|s| s.to_string()).collect();
            lines.push(format!("block {}: inputs [{}]", block, sources.join(", ")));
        }
        let ops: Vec<String> = self.operators.iter().map(|o| o.to_string()).collect();
        lines.push(format!("operators: [{}]", ops.join(", ")));
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space(blocks: usize, inputs: usize, ops: usize) -> StateSpace {
        let config = SpaceConfig {
            num_blocks: blocks,
            operators: Operator::default_catalog().into_iter().take(ops).collect(),
            inputs_per_block: inputs,
            ..Default::default()
        };
        StateSpace::new(&config).unwrap()
    }

    #[test]
    fn test_operator_labels() {
        for op in Operator::default_catalog() {
            let parsed: Operator = op.to_string().parse().unwrap();
            assert_eq!(parsed, op);
        }
        assert_eq!("1x7-7x1 conv".parse::<Operator>().unwrap(), Operator::FactorizedConv { kernel: 7 });
        assert!("4x4 dconv".parse::<Operator>().is_err());
        assert!("3x3 fft".parse::<Operator>().is_err());
    }

    #[test]
    fn test_operator_serde_uses_labels() {
        let json = serde_json::to_string(&Operator::MaxPool { width: 3 }).unwrap();
        assert_eq!(json, "\"3x3 maxpool\"");
        let back: Operator = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Operator::MaxPool { width: 3 });
    }

    #[test]
    fn test_first_block_has_single_input() {
        let space = space(3, 2, 6);
        assert_eq!(space.input_cardinality(0), 1);
        assert_eq!(space.input_cardinality(2), 3);
        assert_eq!(space.cardinality(0), 1);
        assert_eq!(space.cardinality(1), 6);
    }

    #[test]
    fn test_describe_space() {
        let space = space(2, 2, 3);
        let slots = space.describe_space();
        assert_eq!(slots.len(), 8);
        assert_eq!(slots[4].block, 1);
        assert_eq!(slots[4].kind, DecisionKind::Input);
        assert_eq!(slots[4].cardinality, 2);
        assert_eq!(slots[5].kind, DecisionKind::Operator);
    }

    #[test]
    fn test_total_combinations() {
        let space = space(3, 2, 6);
        assert_eq!(space.block_branching(0), 36);
        assert_eq!(space.total_combinations(None), 36 * 144 * 324);
        assert_eq!(space.reachable_at(1, Some(8)), 8 * 144);
        assert_eq!(space.total_models(8, 256), 36 + 8 + 8);
    }

    #[test]
    fn test_lookforward_limits_inputs() {
        let config = SpaceConfig {
            num_blocks: 4,
            lookforward_depth: Some(1),
            lookback_depth: 1,
            ..Default::default()
        };
        let space = StateSpace::new(&config).unwrap();
        assert_eq!(
            space.input_sources(3),
            vec![InputRef::External(0), InputRef::External(1), InputRef::Block(2)]
        );
    }

    #[test]
    fn test_decode_rejects_out_of_range() {
        let space = space(2, 2, 3);
        let err = space.decode(&[1, 0, 0, 0]).unwrap_err();
        assert!(matches!(
            err,
            KolosalError::InvalidToken { position: 0, token: 1, cardinality: 1 }
        ));
        assert!(matches!(
            space.decode(&[0, 0, 0]).unwrap_err(),
            KolosalError::InvalidSequenceLength { .. }
        ));
    }

    #[test]
    fn test_decode_encode() {
        let space = space(2, 2, 3);
        let tokens = vec![0, 2, 0, 1, 1, 0, 0, 2];
        let arch = space.decode(&tokens).unwrap();
        assert_eq!(arch.blocks[1].choices[0].input, InputRef::Block(0));
        assert_eq!(arch.blocks[1].choices[1].input, InputRef::External(0));
        assert_eq!(space.encode(&arch).unwrap(), tokens);
    }

    #[test]
    fn test_enumerate_block() {
        let space = space(2, 1, 3);
        let first = space.enumerate_block(0, &[]);
        assert_eq!(first.len(), 3);
        let second = space.enumerate_block(1, &first[0]);
        assert_eq!(second.len(), 6);
        assert!(second.iter().all(|s| s.len() == 4 && s[..2] == first[0][..]));
    }

    #[test]
    fn test_decision_values() {
        let space = space(1, 2, 6);
        let arch = space.decode(&[0, 4, 0, 0]).unwrap();
        assert_eq!(arch.decision_values(), vec!["-1", "3x3 maxpool", "-1", "3x3 dconv"]);
    }
}
