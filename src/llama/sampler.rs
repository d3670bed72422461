//! 采样器

use llama_cpp_2::{sampling::LlamaSampler, token::LlamaToken};

use crate::{
    backend::{Token, TokenSampler},
    llama::LlamaRuntime,
    sampler::SamplerConfig,
};

/// llama.cpp sampler chain, keeps the penalty history across tokens.
#[allow(missing_debug_implementations)]
pub struct LlamaTokenSampler {
    sampler: LlamaSampler,
}

unsafe impl Send for LlamaTokenSampler {}

impl LlamaTokenSampler {
    /// load sampler
    pub fn new(config: &SamplerConfig) -> Self {
        /* penalties 配置说明:
            减少重复性: penalties(64, 1.2, 0.0, 0.2)
            增加多样性: penalties(64, 1.1, 0.1, 0.0)
            默认平衡: penalties(64, 1.0, 0.0, 0.0)
        */
        let penalties = LlamaSampler::penalties(
            config.penalty_last_n,
            config.penalty_repeat,
            config.penalty_freq,
            config.penalty_present,
        );

        let sampler = if config.is_greedy() {
            // 贪婪采样器，始终选择概率最高的 token
            LlamaSampler::chain_simple([penalties, LlamaSampler::greedy()])
        } else {
            LlamaSampler::chain_simple([
                penalties,
                LlamaSampler::top_k(config.top_k),
                LlamaSampler::top_p(config.top_p, 0),
                LlamaSampler::min_p(config.min_p, 0),
                LlamaSampler::temp(config.temperature),
                LlamaSampler::dist(config.seed()), // 随机种子，应用于最后一个
            ])
        };

        Self { sampler }
    }
}

impl TokenSampler<LlamaRuntime> for LlamaTokenSampler {
    fn sample(&mut self, runtime: &LlamaRuntime, idx: i32) -> Token {
        self.sampler.sample(runtime.context(), idx).0
    }

    fn accept(&mut self, token: Token) {
        self.sampler.accept(LlamaToken(token));
    }
}
