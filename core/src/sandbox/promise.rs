//! 即时 Promise：沙箱的同步化异步外观。
//!
//! 宿主保证所有原生桥调用从脚本视角都是同步完成的，因此 `then`/`catch`
//! 的回调在前驱落定后立即同步执行；`await_now` 强制取出已落定的值，
//! 对未落定的 Promise 抛出 "asynchronous result not supported"。
//! 脚本可以沿用 Promise 风格编写，但宿主不提供真正的并发或调度。

use std::sync::{Arc, Mutex};

use rhai::{Dynamic, Engine, EvalAltResult, FnPtr, NativeCallContext};

pub const ASYNC_UNSUPPORTED_MSG: &str = "asynchronous result not supported";

#[derive(Clone)]
enum PromiseState {
    Pending,
    Fulfilled(Dynamic),
    Rejected(Dynamic),
}

/// 立即落定的 Promise。克隆共享同一状态。
#[derive(Clone)]
pub struct ImmediatePromise {
    state: Arc<Mutex<PromiseState>>,
}

impl ImmediatePromise {
    pub fn pending() -> Self {
        Self::from_state(PromiseState::Pending)
    }

    /// 构造已兑现的 Promise；值本身是 Promise 时摊平（采用其当前状态）
    pub fn fulfilled(value: Dynamic) -> Self {
        if value.is::<ImmediatePromise>() {
            if let Some(inner) = value.try_cast::<ImmediatePromise>() {
                return Self::from_state(inner.snapshot());
            }
            return Self::pending();
        }
        Self::from_state(PromiseState::Fulfilled(value))
    }

    pub fn rejected(error: Dynamic) -> Self {
        Self::from_state(PromiseState::Rejected(error))
    }

    fn from_state(state: PromiseState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn snapshot(&self) -> PromiseState {
        match self.state.lock() {
            Ok(guard) => guard.clone(),
            Err(e) => e.into_inner().clone(),
        }
    }

    pub fn state_name(&self) -> &'static str {
        match self.snapshot() {
            PromiseState::Pending => "pending",
            PromiseState::Fulfilled(_) => "fulfilled",
            PromiseState::Rejected(_) => "rejected",
        }
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self.snapshot(), PromiseState::Pending)
    }

    /// 强制取值：未落定即违反沙箱契约
    pub fn unwrap_settled(&self) -> Result<Dynamic, Box<EvalAltResult>> {
        match self.snapshot() {
            PromiseState::Fulfilled(v) => Ok(v),
            PromiseState::Rejected(e) => Err(e.to_string().into()),
            PromiseState::Pending => Err(ASYNC_UNSUPPORTED_MSG.into()),
        }
    }
}

fn call_handler(ctx: &NativeCallContext, handler: &FnPtr, arg: Dynamic) -> ImmediatePromise {
    match handler.call_within_context::<Dynamic>(ctx, (arg,)) {
        Ok(out) => ImmediatePromise::fulfilled(out),
        Err(e) => ImmediatePromise::rejected(Dynamic::from(e.to_string())),
    }
}

/// 注册 Promise 类型与全局构造/取值函数
pub fn register(engine: &mut Engine) {
    engine.register_type_with_name::<ImmediatePromise>("Promise");

    engine.register_fn(
        "then",
        |ctx: NativeCallContext, p: ImmediatePromise, on_fulfilled: FnPtr| -> ImmediatePromise {
            match p.snapshot() {
                PromiseState::Pending => ImmediatePromise::pending(),
                PromiseState::Fulfilled(v) => call_handler(&ctx, &on_fulfilled, v),
                PromiseState::Rejected(e) => ImmediatePromise::rejected(e),
            }
        },
    );

    engine.register_fn(
        "then",
        |ctx: NativeCallContext,
         p: ImmediatePromise,
         on_fulfilled: FnPtr,
         on_rejected: FnPtr|
         -> ImmediatePromise {
            match p.snapshot() {
                PromiseState::Pending => ImmediatePromise::pending(),
                PromiseState::Fulfilled(v) => call_handler(&ctx, &on_fulfilled, v),
                PromiseState::Rejected(e) => call_handler(&ctx, &on_rejected, e),
            }
        },
    );

    engine.register_fn(
        "catch",
        |ctx: NativeCallContext, p: ImmediatePromise, on_rejected: FnPtr| -> ImmediatePromise {
            match p.snapshot() {
                PromiseState::Pending => ImmediatePromise::pending(),
                PromiseState::Fulfilled(v) => ImmediatePromise::fulfilled(v),
                PromiseState::Rejected(e) => call_handler(&ctx, &on_rejected, e),
            }
        },
    );

    engine.register_fn("state", |p: ImmediatePromise| -> String {
        p.state_name().to_string()
    });
    engine.register_fn("is_settled", |p: ImmediatePromise| -> bool { p.is_settled() });

    engine.register_fn("promise_resolve", |value: Dynamic| -> ImmediatePromise {
        ImmediatePromise::fulfilled(value)
    });
    engine.register_fn("promise_reject", |error: Dynamic| -> ImmediatePromise {
        ImmediatePromise::rejected(error)
    });
    engine.register_fn("promise_pending", || -> ImmediatePromise {
        ImmediatePromise::pending()
    });

    engine.register_fn("promise_all", |values: rhai::Array| -> ImmediatePromise {
        let mut results = rhai::Array::with_capacity(values.len());
        for value in values {
            if value.is::<ImmediatePromise>() {
                let Some(p) = value.try_cast::<ImmediatePromise>() else {
                    return ImmediatePromise::pending();
                };
                match p.snapshot() {
                    PromiseState::Pending => return ImmediatePromise::pending(),
                    PromiseState::Rejected(e) => return ImmediatePromise::rejected(e),
                    PromiseState::Fulfilled(v) => results.push(v),
                }
            } else {
                results.push(value);
            }
        }
        ImmediatePromise::fulfilled(Dynamic::from(results))
    });

    // 桥接取值函数：接受任意值，Promise 被强制解包，普通值原样返回
    engine.register_fn(
        "await_now",
        |value: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
            if value.is::<ImmediatePromise>() {
                match value.try_cast::<ImmediatePromise>() {
                    Some(p) => p.unwrap_settled(),
                    None => Err(ASYNC_UNSUPPORTED_MSG.into()),
                }
            } else {
                Ok(value)
            }
        },
    );
}
