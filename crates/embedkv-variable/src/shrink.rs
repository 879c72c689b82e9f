//! Shrink arguments and policy selection.

use embedkv_core::config::EmbeddingConfig;
use embedkv_core::layout::EmbeddingLayout;
use embedkv_storage::ShrinkPolicy;

/// Arguments to a shrink pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShrinkArgs {
    /// The current global training step, used by step-TTL pruning.
    pub global_step: i64,
}

impl ShrinkArgs {
    /// Creates args for the given global step.
    pub fn new(global_step: i64) -> Self {
        Self { global_step }
    }
}

/// The shrink policies enabled by a variable's configuration.
///
/// Step TTL prunes ids whose version has fallen out of the window
/// (strictly: survivors satisfy `version > global_step - steps_to_live`);
/// L2 prunes ids whose primary sub-embedding's squared norm is below the
/// threshold.
pub fn policies_for(
    config: &EmbeddingConfig,
    layout: &EmbeddingLayout,
    args: ShrinkArgs,
) -> Vec<ShrinkPolicy> {
    let mut policies = Vec::new();
    if config.steps_to_live > 0 {
        policies.push(ShrinkPolicy::StepsToLive {
            steps_to_live: config.steps_to_live,
            global_step: args.global_step,
        });
    }
    if config.l2_weight_threshold >= 0.0 {
        if let Ok(primary) = layout.sub_embedding(0) {
            policies.push(ShrinkPolicy::L2Norm {
                threshold: config.l2_weight_threshold,
                primary,
            });
        }
    }
    policies
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedkv_core::layout::LayoutKind;

    #[test]
    fn test_policy_selection() {
        let layout = EmbeddingLayout::new(LayoutKind::Normal, 4, 1).unwrap();

        let config = EmbeddingConfig::new("ev");
        assert!(policies_for(&config, &layout, ShrinkArgs::default()).is_empty());

        let config = EmbeddingConfig::new("ev").with_steps_to_live(5);
        let policies = policies_for(&config, &layout, ShrinkArgs::new(30));
        assert_eq!(policies.len(), 1);
        assert!(matches!(
            policies[0],
            ShrinkPolicy::StepsToLive {
                steps_to_live: 5,
                global_step: 30
            }
        ));

        let config = EmbeddingConfig::new("ev")
            .with_steps_to_live(5)
            .with_l2_weight_threshold(14.0);
        assert_eq!(policies_for(&config, &layout, ShrinkArgs::new(1)).len(), 2);
    }
}
