//! 凭据池：均匀随机、放回抽样。
//!
//! 每次尝试独立抽取，同一请求的回退序列里可能重复抽到同一个 Key；
//! 这里不跟踪失败，也不做负载均衡。

use crate::credential::types::Credential;
use crate::error::PreconditionError;
use std::cell::Cell;

thread_local! {
    /// 抽取 Key 用的 xorshift64* 状态，每个工作线程各自一份。
    static PICK_STATE: Cell<u64> = Cell::new(initial_state());
}

/// 线程首次抽取时初始化；xorshift 的状态不能为 0。
fn initial_state() -> u64 {
    let u = uuid::Uuid::new_v4().as_u128();
    match (u as u64) ^ ((u >> 64) as u64) {
        0 => 0x9E37_79B9_7F4A_7C15,
        s => s,
    }
}

fn next_u64() -> u64 {
    PICK_STATE.with(|state| {
        let mut x = state.get();
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        state.set(x);
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    })
}

/// 在 `[0, len)` 内均匀取一个下标；`len <= 1` 时恒为 0。
pub fn random_index(len: usize) -> usize {
    if len <= 1 {
        return 0;
    }
    (next_u64() % len as u64) as usize
}

#[derive(Debug, Default)]
pub struct CredentialPool {
    credentials: Vec<Credential>,
}

impl CredentialPool {
    /// 按配置顺序建池，下标即 `Credential::index`；空白 Key 会被跳过。
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let credentials = secrets
            .into_iter()
            .filter_map(|s| {
                let s = s.as_ref().trim();
                (!s.is_empty()).then(|| s.to_string())
            })
            .enumerate()
            .map(|(i, s)| Credential::new(i, s))
            .collect();
        Self { credentials }
    }

    pub fn pick(&self) -> Result<&Credential, PreconditionError> {
        if self.credentials.is_empty() {
            return Err(PreconditionError::EmptyPool);
        }
        Ok(&self.credentials[random_index(self.credentials.len())])
    }

    #[cfg(test)]
    pub fn get(&self, index: usize) -> Option<&Credential> {
        self.credentials.get(index)
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Credential> {
        self.credentials.iter()
    }
}
