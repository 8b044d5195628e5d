//! Hill climbing on target observations.
//!
//! The optimiser assumes that some prefix of a test case matters and tries
//! regenerating everything after it. A prefix ends where a chosen non-empty
//! example starts. Examples are picked first by taking the last non-empty
//! one, then by picking non-empty ones at random. Each strategy runs until
//! `max_failures` consecutive attempts fail to raise the score.

use std::rc::Rc;

use log::{debug, trace};
use rand::Rng;
use rand::rngs::StdRng;

use crate::data::{ConjectureResult, Status};
use crate::rng::create_seeded_rng;
use crate::source::GenerationParameters;

/// What the optimiser needs from the runner
pub trait OptimiserEngine {
    type Error;

    fn random(&mut self) -> &mut StdRng;

    fn cached_test_function(&mut self, buffer: &[u8])
        -> Result<Rc<ConjectureResult>, Self::Error>;

    /// Run the test on `prefix` followed by bytes from `parameters`.
    ///
    /// Returns `None` without running anything if the choice tree already
    /// knows how that test case behaves.
    fn test_novel_extension(
        &mut self,
        prefix: &[u8],
        parameters: GenerationParameters,
    ) -> Result<Option<Rc<ConjectureResult>>, Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExampleSelection {
    LastNonEmpty,
    RandomNonEmpty,
}

/// Raises the score of one target label by hill climbing
pub struct Optimiser<'e, X> {
    engine: &'e mut X,
    current: Rc<ConjectureResult>,
    target: String,
    max_failures: usize,
    improvements: usize,
}

impl<'e, X: OptimiserEngine> Optimiser<'e, X> {
    pub fn new(
        engine: &'e mut X,
        initial: Rc<ConjectureResult>,
        target: impl Into<String>,
        max_failures: usize,
    ) -> Self {
        Self {
            engine,
            current: initial,
            target: target.into(),
            max_failures,
            improvements: 0,
        }
    }

    pub fn current(&self) -> &Rc<ConjectureResult> {
        &self.current
    }

    /// Number of strictly improving steps taken
    pub fn improvements(&self) -> usize {
        self.improvements
    }

    fn score(&self, result: &ConjectureResult) -> Option<f64> {
        result.target_observations.get(&self.target).copied()
    }

    /// Adopt `result` if its score is strictly higher than the current one
    fn consider(&mut self, result: Rc<ConjectureResult>) -> bool {
        if result.status < Status::Valid {
            return false;
        }
        let improved = match (self.score(&result), self.score(&self.current)) {
            (Some(new), Some(old)) => new > old,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if improved {
            trace!(
                "Target {:?} improved to {:?}",
                self.target,
                self.score(&result)
            );
            self.current = result;
            self.improvements += 1;
        }
        improved
    }

    pub fn run(&mut self) -> Result<(), X::Error> {
        for selection in [ExampleSelection::LastNonEmpty, ExampleSelection::RandomNonEmpty] {
            self.hill_climb(selection)?;
        }
        debug!(
            "Optimised {:?} to {:?} with {} improvements",
            self.target,
            self.score(&self.current),
            self.improvements
        );
        Ok(())
    }

    fn select_example(&mut self, selection: ExampleSelection) -> Option<usize> {
        let non_empty: Vec<usize> = self
            .current
            .examples
            .iter()
            .enumerate()
            .filter(|(_, ex)| !ex.is_empty())
            .map(|(i, _)| i)
            .collect();
        match selection {
            ExampleSelection::LastNonEmpty => non_empty.last().copied(),
            ExampleSelection::RandomNonEmpty if non_empty.is_empty() => None,
            ExampleSelection::RandomNonEmpty => {
                let i = self.engine.random().gen_range(0..non_empty.len());
                Some(non_empty[i])
            }
        }
    }

    fn new_parameters(&mut self) -> GenerationParameters {
        GenerationParameters::new(create_seeded_rng(self.engine.random().r#gen()))
    }

    fn hill_climb(&mut self, selection: ExampleSelection) -> Result<(), X::Error> {
        let mut parameters = self.new_parameters();
        let mut consecutive_failures = 0;
        // Once the target is interesting there is nothing more to gain
        while consecutive_failures < self.max_failures && self.current.status <= Status::Valid {
            let Some(example) = self.select_example(selection) else {
                return Ok(());
            };
            if self.attempt_to_improve(example, parameters.clone())? {
                consecutive_failures = 0;
            } else {
                parameters = self.new_parameters();
                consecutive_failures += 1;
            }
        }
        Ok(())
    }

    /// Regenerate everything from the start of `example` onwards, then try
    /// splicing the regenerated example back into the current test case
    fn attempt_to_improve(
        &mut self,
        example: usize,
        parameters: GenerationParameters,
    ) -> Result<bool, X::Error> {
        let current = Rc::clone(&self.current);
        let ex = &current.examples[example];
        let prefix = &current.buffer[..ex.start];

        let Some(attempt) = self.engine.test_novel_extension(prefix, parameters)? else {
            return Ok(false);
        };
        if self.consider(Rc::clone(&attempt)) {
            return Ok(true);
        }

        let Some(replacement) = attempt.examples.get(example) else {
            return Ok(false);
        };
        let mut spliced = prefix.to_vec();
        spliced.extend_from_slice(attempt.example_bytes(replacement));
        spliced.extend_from_slice(&current.buffer[ex.end..]);
        let result = self.engine.cached_test_function(&spliced)?;
        Ok(self.consider(result))
    }
}
