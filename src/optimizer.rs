use std::collections::HashMap;

use candle_core::{backprop::GradStore, DType, Result, Tensor, Var};
use candle_nn::Optimizer;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamsAdam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl ParamsAdam {
    /// Transformer defaults: betas (0.9, 0.98), eps 1e-9.
    pub fn with_lr(lr: f64) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.98,
            eps: 1e-9,
        }
    }
}

struct AdamSlot {
    name: String,
    var: Var,
    first_moment: Tensor,
    second_moment: Tensor,
}

/// Adam without weight decay. Unlike `candle_nn::AdamW`, every slot is named
/// so the moments and step count can be written into checkpoints.
pub struct Adam {
    slots: Vec<AdamSlot>,
    step_t: usize,
    params: ParamsAdam,
}

const STEP_KEY: &str = "optimizer.step";

fn moment_keys(name: &str) -> (String, String) {
    (format!("optimizer.m.{name}"), format!("optimizer.v.{name}"))
}

impl Adam {
    pub fn from_named(vars: Vec<(String, Var)>, params: ParamsAdam) -> Result<Self> {
        let slots = vars
            .into_iter()
            .filter(|(_, var)| var.dtype().is_float())
            .map(|(name, var)| {
                Ok(AdamSlot {
                    name,
                    first_moment: var.zeros_like()?,
                    second_moment: var.zeros_like()?,
                    var,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            slots,
            step_t: 0,
            params,
        })
    }

    pub fn step_count(&self) -> usize {
        self.step_t
    }

    /// Moments and step count keyed for a safetensors checkpoint.
    pub fn state(&self) -> Result<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        for slot in &self.slots {
            let (m_key, v_key) = moment_keys(&slot.name);
            state.insert(m_key, slot.first_moment.clone());
            state.insert(v_key, slot.second_moment.clone());
        }
        let device = self
            .slots
            .first()
            .map(|s| s.var.device().clone())
            .unwrap_or(candle_core::Device::Cpu);
        state.insert(
            STEP_KEY.to_string(),
            Tensor::new(&[self.step_t as u32], &device)?,
        );
        Ok(state)
    }

    /// Restores moments for every slot from `state`; missing entries are an error.
    pub fn load_state(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        let get = |key: &str| {
            state
                .get(key)
                .ok_or_else(|| candle_core::Error::Msg(format!("optimizer state has no `{key}`")))
        };
        for slot in self.slots.iter_mut() {
            let (m_key, v_key) = moment_keys(&slot.name);
            let device = slot.var.device();
            let dtype = slot.var.dtype();
            for (key, target) in [
                (m_key, &mut slot.first_moment),
                (v_key, &mut slot.second_moment),
            ] {
                let value = get(key.as_str())?;
                if value.dims() != slot.var.dims() {
                    candle_core::bail!(
                        "`{key}` has shape {:?}, expected {:?}",
                        value.dims(),
                        slot.var.dims()
                    );
                }
                *target = value.to_device(device)?.to_dtype(dtype)?;
            }
        }
        self.step_t = get(STEP_KEY)?
            .to_dtype(DType::U32)?
            .flatten_all()?
            .get(0)?
            .to_scalar::<u32>()? as usize;
        Ok(())
    }
}

impl Optimizer for Adam {
    type Config = ParamsAdam;

    fn new(vars: Vec<Var>, params: ParamsAdam) -> Result<Self> {
        let named = vars
            .into_iter()
            .enumerate()
            .map(|(i, var)| (format!("param_{i}"), var))
            .collect();
        Self::from_named(named, params)
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_t += 1;
        let ParamsAdam {
            lr,
            beta1,
            beta2,
            eps,
        } = self.params;
        let scale_m = 1f64 / (1f64 - beta1.powi(self.step_t as i32));
        let scale_v = 1f64 / (1f64 - beta2.powi(self.step_t as i32));
        for slot in self.slots.iter_mut() {
            let theta = &slot.var;
            if let Some(g) = grads.get(theta) {
                let m = ((&slot.first_moment * beta1)? + (g * (1.0 - beta1))?)?;
                let v = ((&slot.second_moment * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;
                let m_hat = (&m * scale_m)?;
                let v_hat = (&v * scale_v)?;
                let update = (m_hat / (v_hat.sqrt()? + eps)?)?;
                theta.set(&theta.sub(&(update * lr)?)?)?;
                slot.first_moment = m;
                slot.second_moment = v;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn test_adam_minimizes_quadratic() {
        let device = Device::Cpu;
        let w = Var::new(&[3f32, -2.], &device).unwrap();
        let mut opt = Adam::from_named(
            vec![("w".to_string(), w.clone())],
            ParamsAdam::with_lr(0.1),
        )
        .unwrap();
        for _ in 0..300 {
            let loss = w.as_tensor().sqr().unwrap().sum_all().unwrap();
            opt.backward_step(&loss).unwrap();
        }
        let w = w.as_tensor().to_vec1::<f32>().unwrap();
        assert!(w.iter().all(|x| x.abs() < 0.05), "{w:?}");
        assert_eq!(opt.step_count(), 300);
    }

    #[test]
    fn test_first_step_moves_by_lr() {
        // with bias correction the first update is lr * sign(g)
        let device = Device::Cpu;
        let w = Var::new(&[1f32, -1.], &device).unwrap();
        let mut opt = Adam::new(vec![w.clone()], ParamsAdam::with_lr(0.01)).unwrap();
        let loss = w.as_tensor().sum_all().unwrap();
        opt.backward_step(&loss).unwrap();
        let w = w.as_tensor().to_vec1::<f32>().unwrap();
        assert!((w[0] - 0.99).abs() < 1e-5);
        assert!((w[1] + 1.01).abs() < 1e-5);
    }

    #[test]
    fn test_state_round_trip() {
        let device = Device::Cpu;
        let w = Var::new(&[1f32, 2.], &device).unwrap();
        let mut opt =
            Adam::from_named(vec![("w".to_string(), w.clone())], ParamsAdam::with_lr(0.01)).unwrap();
        let loss = w.as_tensor().sqr().unwrap().sum_all().unwrap();
        opt.backward_step(&loss).unwrap();
        let state = opt.state().unwrap();

        let mut restored =
            Adam::from_named(vec![("w".to_string(), w.clone())], ParamsAdam::with_lr(0.01)).unwrap();
        restored.load_state(&state).unwrap();
        assert_eq!(restored.step_count(), 1);
        let restored_state = restored.state().unwrap();
        for key in ["optimizer.m.w", "optimizer.v.w"] {
            assert_eq!(
                state[key].to_vec1::<f32>().unwrap(),
                restored_state[key].to_vec1::<f32>().unwrap()
            );
        }

        let mut stranger =
            Adam::from_named(vec![("other".to_string(), w)], ParamsAdam::with_lr(0.01)).unwrap();
        assert!(stranger.load_state(&state).is_err());
    }
}
