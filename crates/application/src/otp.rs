use domain::OneTimeCode;
use rand::Rng;

/// 验证码生成器
pub trait OtpGenerator: Send + Sync {
    fn generate(&self) -> OneTimeCode;
}

/// 在 [100000, 999999] 上均匀分布
#[derive(Debug, Default)]
pub struct RandomOtpGenerator;

impl OtpGenerator for RandomOtpGenerator {
    fn generate(&self) -> OneTimeCode {
        let value = rand::rng().random_range(OneTimeCode::MIN..=OneTimeCode::MAX);
        OneTimeCode::new(value).unwrap_or_else(|_| unreachable!("value drawn from the valid range"))
    }
}

/// 固定验证码，仅用于测试与本地联调
#[derive(Debug, Clone, Copy)]
pub struct FixedOtpGenerator(pub OneTimeCode);

impl OtpGenerator for FixedOtpGenerator {
    fn generate(&self) -> OneTimeCode {
        self.0
    }
}
