//! `simple_ir_eval`: a reference interpreter over the prepared loop nest.
//!
//! Buffers are untyped byte regions addressed through raw pointers; scalar
//! access goes through the element type recorded on each buffer. Loops
//! marked parallel fan out over the rayon thread pool, which is sound
//! because the shaping policies only mark loops whose iterations touch
//! disjoint locations.

use half::f16;
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::dtype::ScalarType;
use crate::error::{Error, Result};
use crate::ir::{BinOp, Buf, CmpOp, Expr, Imm, Stmt, UnOp};
use crate::runtime::CallArg;

use super::{BufferArg, CodeGen, CodeGenSpec};

/// A raw buffer base address that may cross thread boundaries. Parallel
/// loop bodies write disjoint elements, so shared access is safe.
#[derive(Clone, Copy)]
struct BufPtr(*mut u8);

unsafe impl Send for BufPtr {}
unsafe impl Sync for BufPtr {}

pub struct SimpleIrEval {
    spec: CodeGenSpec,
}

impl SimpleIrEval {
    pub fn new(spec: CodeGenSpec) -> SimpleIrEval {
        SimpleIrEval { spec }
    }

    fn machine(&self, args: &[CallArg]) -> Result<(Machine, Scope)> {
        if args.len() != self.spec.buffer_args.len() {
            return Err(Error::MalformedInput(format!(
                "kernel '{}' expects {} arguments, got {}",
                self.spec.kernel_name,
                self.spec.buffer_args.len(),
                args.len()
            )));
        }
        let mut bufs = FxHashMap::default();
        let mut scope = Scope::default();
        for (param, arg) in self.spec.buffer_args.iter().zip(args) {
            match (param, arg) {
                (BufferArg::Buf(buf), CallArg::Ptr(ptr)) => {
                    bufs.insert(buf.id(), BufPtr(*ptr));
                }
                (BufferArg::Var(var), arg) => {
                    let imm = match (var.dtype(), arg) {
                        (ScalarType::Double, CallArg::Double(v)) => Imm::Double(*v),
                        (ScalarType::Double, CallArg::Int(v)) => Imm::Double(*v as f64),
                        (ScalarType::Bool, CallArg::Int(v)) => Imm::Bool(*v != 0),
                        (_, CallArg::Int(v)) => Imm::Long(*v),
                        (_, CallArg::Double(v)) => Imm::Double(*v),
                        (dtype, CallArg::Ptr(ptr)) => unsafe { read_imm(*ptr, dtype) },
                    };
                    scope.insert(var.id(), imm);
                }
                (BufferArg::Buf(buf), other) => {
                    return Err(Error::MalformedInput(format!(
                        "expected a pointer for buffer '{}', got {other:?}",
                        buf.name()
                    )));
                }
            }
        }
        Ok((Machine { bufs, temps: vec![] }, scope))
    }
}

impl CodeGen for SimpleIrEval {
    fn call(&self, args: &[CallArg]) -> Result<()> {
        let (mut machine, mut scope) = self.machine(args)?;
        machine.run(self.spec.stmt.as_ref(), &mut scope)
    }

    fn call_raw(&self, args: &[*mut u8]) -> Result<()> {
        let wrapped: Vec<CallArg> = args.iter().map(|&p| CallArg::Ptr(p)).collect();
        self.call(&wrapped)
    }

    fn stmt(&self) -> &Stmt {
        self.spec.stmt.as_ref()
    }
}

type Scope = FxHashMap<usize, Imm>;

struct Machine {
    bufs: FxHashMap<usize, BufPtr>,
    temps: Vec<Box<[u8]>>,
}

impl Machine {
    /// Top-level execution: handles allocations, then delegates.
    fn run(&mut self, stmt: &Stmt, scope: &mut Scope) -> Result<()> {
        match stmt {
            Stmt::Block(children) => {
                for child in children {
                    match child {
                        Stmt::Allocate(buf) => self.allocate(buf, scope)?,
                        Stmt::Free(buf) => {
                            self.bufs.remove(&buf.id());
                        }
                        other => self.exec(other, scope)?,
                    }
                }
                Ok(())
            }
            other => self.exec(other, scope),
        }
    }

    fn allocate(&mut self, buf: &Buf, scope: &Scope) -> Result<()> {
        let mut numel = 1i64;
        for dim in buf.dims() {
            numel *= self.eval(dim, scope)?.to_long();
        }
        let bytes = vec![0u8; numel.max(1) as usize * buf.dtype().size_bytes()];
        let mut boxed = bytes.into_boxed_slice();
        let ptr = BufPtr(boxed.as_mut_ptr());
        self.temps.push(boxed);
        self.bufs.insert(buf.id(), ptr);
        Ok(())
    }

    /// Executes a statement without touching the allocation table, so it can
    /// run from parallel loop bodies.
    fn exec(&self, stmt: &Stmt, scope: &mut Scope) -> Result<()> {
        match stmt {
            Stmt::Block(children) => {
                for child in children {
                    self.exec(child, scope)?;
                }
                Ok(())
            }
            Stmt::For(f) => {
                let start = self.eval(&f.start, scope)?.to_long();
                let stop = self.eval(&f.stop, scope)?.to_long();
                if f.opts.parallel {
                    (start..stop.max(start)).into_par_iter().try_for_each(
                        |i| -> Result<()> {
                            let mut local = scope.clone();
                            local.insert(f.var.id(), Imm::Long(i));
                            self.exec(&f.body, &mut local)
                        },
                    )?;
                } else {
                    for i in start..stop {
                        scope.insert(f.var.id(), Imm::Long(i));
                        self.exec(&f.body, scope)?;
                    }
                    scope.remove(&f.var.id());
                }
                Ok(())
            }
            Stmt::Store(store) => {
                let ptr = self.buf_ptr(&store.buf)?;
                let offset = self.element_offset(&store.buf, &store.indices, scope)?;
                let value = self.eval(&store.value, scope)?;
                unsafe {
                    write_imm(
                        ptr.0.add(offset as usize * store.buf.dtype().size_bytes()),
                        cast_imm(value, store.buf.dtype()),
                    );
                }
                Ok(())
            }
            Stmt::Cond {
                condition,
                then_body,
                else_body,
            } => {
                if self.eval(condition, scope)?.to_long() != 0 {
                    self.exec(then_body, scope)
                } else if let Some(else_body) = else_body {
                    self.exec(else_body, scope)
                } else {
                    Ok(())
                }
            }
            Stmt::Allocate(buf) | Stmt::Free(buf) => Err(Error::Internal(format!(
                "allocation of '{}' outside the root block",
                buf.name()
            ))),
        }
    }

    fn buf_ptr(&self, buf: &Buf) -> Result<BufPtr> {
        self.bufs
            .get(&buf.id())
            .copied()
            .ok_or_else(|| Error::Internal(format!("unbound buffer '{}'", buf.name())))
    }

    /// Flat element offset for an access. Prepared kernels carry a single
    /// flat index; multi-dimensional accesses fold through row-major
    /// strides.
    fn element_offset(&self, buf: &Buf, indices: &[Expr], scope: &Scope) -> Result<i64> {
        if indices.len() == 1 {
            return Ok(self.eval(&indices[0], scope)?.to_long());
        }
        if indices.is_empty() {
            return Ok(0);
        }
        let strides = buf.contiguous_stride_exprs();
        let mut offset = 0i64;
        for (index, stride) in indices.iter().zip(&strides) {
            offset += self.eval(index, scope)?.to_long() * self.eval(stride, scope)?.to_long();
        }
        Ok(offset)
    }

    fn eval(&self, expr: &Expr, scope: &Scope) -> Result<Imm> {
        match expr {
            Expr::Imm(imm) => Ok(*imm),
            Expr::Var(var) => scope.get(&var.id()).copied().ok_or_else(|| {
                Error::Internal(format!("undefined variable '{}'", var.name()))
            }),
            Expr::Load { buf, indices } => {
                let ptr = self.buf_ptr(buf)?;
                let offset = self.element_offset(buf, indices, scope)?;
                let dtype = buf.dtype();
                Ok(unsafe { read_imm(ptr.0.add(offset as usize * dtype.size_bytes()), dtype) })
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.eval(lhs, scope)?;
                let rhs = self.eval(rhs, scope)?;
                let dtype = lhs.dtype().promote(rhs.dtype());
                if dtype.is_floating_point() {
                    let (a, b) = (lhs.to_double(), rhs.to_double());
                    let v = match op {
                        BinOp::Add => a + b,
                        BinOp::Sub => a - b,
                        BinOp::Mul => a * b,
                        BinOp::Div => a / b,
                        BinOp::Mod => a % b,
                        BinOp::Max => a.max(b),
                        BinOp::Min => a.min(b),
                    };
                    Ok(Imm::from_double(v, dtype))
                } else {
                    let (a, b) = (lhs.to_long(), rhs.to_long());
                    if b == 0 && matches!(op, BinOp::Div | BinOp::Mod) {
                        return Err(Error::Internal("integer division by zero".to_string()));
                    }
                    let v = match op {
                        BinOp::Add => a.wrapping_add(b),
                        BinOp::Sub => a.wrapping_sub(b),
                        BinOp::Mul => a.wrapping_mul(b),
                        BinOp::Div => a / b,
                        BinOp::Mod => a % b,
                        BinOp::Max => a.max(b),
                        BinOp::Min => a.min(b),
                    };
                    Ok(cast_long(v, dtype))
                }
            }
            Expr::Compare(op, lhs, rhs) => {
                let a = self.eval(lhs, scope)?.to_double();
                let b = self.eval(rhs, scope)?.to_double();
                let v = match op {
                    CmpOp::Eq => a == b,
                    CmpOp::Ne => a != b,
                    CmpOp::Lt => a < b,
                    CmpOp::Le => a <= b,
                    CmpOp::Gt => a > b,
                    CmpOp::Ge => a >= b,
                };
                Ok(Imm::Bool(v))
            }
            Expr::Unary(op, operand) => {
                let value = self.eval(operand, scope)?;
                let dtype = value.dtype();
                let x = value.to_double();
                let v = match op {
                    UnOp::Neg => -x,
                    UnOp::Abs => x.abs(),
                    UnOp::Sqrt => x.sqrt(),
                    UnOp::Exp => x.exp(),
                    UnOp::Log => x.ln(),
                    UnOp::Tanh => x.tanh(),
                    UnOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
                };
                if dtype.is_floating_point() {
                    Ok(Imm::from_double(v, dtype))
                } else {
                    Ok(cast_long(v as i64, dtype))
                }
            }
            Expr::Cast(dtype, operand) => Ok(cast_imm(self.eval(operand, scope)?, *dtype)),
        }
    }
}

fn cast_long(value: i64, dtype: ScalarType) -> Imm {
    match dtype {
        ScalarType::Bool => Imm::Bool(value != 0),
        ScalarType::Byte => Imm::Byte(value as u8),
        ScalarType::Char => Imm::Char(value as i8),
        ScalarType::Short => Imm::Short(value as i16),
        ScalarType::Int => Imm::Int(value as i32),
        _ => Imm::Long(value),
    }
}

fn cast_imm(imm: Imm, dtype: ScalarType) -> Imm {
    if !imm.dtype().is_floating_point() && !dtype.is_floating_point() {
        return cast_long(imm.to_long(), dtype);
    }
    Imm::from_double(imm.to_double(), dtype)
}

unsafe fn read_imm(ptr: *const u8, dtype: ScalarType) -> Imm {
    match dtype {
        ScalarType::Bool => Imm::Bool(*ptr != 0),
        ScalarType::Byte => Imm::Byte(*ptr),
        ScalarType::Char => Imm::Char(*(ptr as *const i8)),
        ScalarType::Short => Imm::Short((ptr as *const i16).read_unaligned()),
        ScalarType::Int => Imm::Int((ptr as *const i32).read_unaligned()),
        ScalarType::Long => Imm::Long((ptr as *const i64).read_unaligned()),
        ScalarType::Half => Imm::Half((ptr as *const f16).read_unaligned()),
        ScalarType::Float => Imm::Float((ptr as *const f32).read_unaligned()),
        ScalarType::Double => Imm::Double((ptr as *const f64).read_unaligned()),
    }
}

unsafe fn write_imm(ptr: *mut u8, imm: Imm) {
    match imm {
        Imm::Bool(v) => *ptr = v as u8,
        Imm::Byte(v) => *ptr = v,
        Imm::Char(v) => *(ptr as *mut i8) = v,
        Imm::Short(v) => (ptr as *mut i16).write_unaligned(v),
        Imm::Int(v) => (ptr as *mut i32).write_unaligned(v),
        Imm::Long(v) => (ptr as *mut i64).write_unaligned(v),
        Imm::Half(v) => (ptr as *mut f16).write_unaligned(v),
        Imm::Float(v) => (ptr as *mut f32).write_unaligned(v),
        Imm::Double(v) => (ptr as *mut f64).write_unaligned(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::Device;
    use crate::ir::Var;
    use crate::runtime::TensorData;
    use std::sync::Arc;

    fn eval_kernel(stmt: Stmt, buffer_args: Vec<BufferArg>, args: &[CallArg]) {
        let eval = SimpleIrEval::new(CodeGenSpec {
            stmt: Arc::new(stmt),
            buffer_args,
            device: Device::Cpu,
            kernel_name: "test".to_string(),
        });
        eval.call(args).unwrap();
    }

    #[test]
    fn test_elementwise_loop() {
        let x = Buf::new("x", vec![Expr::long(4)], ScalarType::Float);
        let out = Buf::new("out", vec![Expr::long(4)], ScalarType::Float);
        let i = Var::new("i", ScalarType::Long);
        let body = Stmt::store(
            &out,
            vec![Expr::Var(i.clone())],
            Expr::load(&x, vec![Expr::Var(i.clone())]) * Expr::from(2.0f32),
        );
        let stmt = Stmt::loop_over(i, Expr::long(4), body);

        let xt = TensorData::from_vec(vec![1f32, 2., 3., 4.], &[4]);
        let ot = TensorData::zeros(&[4], ScalarType::Float);
        eval_kernel(
            stmt,
            vec![BufferArg::Buf(x), BufferArg::Buf(out)],
            &[CallArg::Ptr(xt.data_ptr()), CallArg::Ptr(ot.data_ptr())],
        );
        assert_eq!(ot.to_vec::<f32>(), vec![2., 4., 6., 8.]);
    }

    #[test]
    fn test_parallel_loop_matches_sequential() {
        let x = Buf::new("x", vec![Expr::long(64)], ScalarType::Float);
        let out = Buf::new("out", vec![Expr::long(64)], ScalarType::Float);
        let i = Var::new("i", ScalarType::Long);
        let body = Stmt::store(
            &out,
            vec![Expr::Var(i.clone())],
            Expr::load(&x, vec![Expr::Var(i.clone())]) + Expr::from(1.0f32),
        );
        let mut f = crate::ir::For::new(i, Expr::long(0), Expr::long(64), body);
        f.opts.parallel = true;
        let stmt = Stmt::For(Box::new(f));

        let data: Vec<f32> = (0..64).map(|v| v as f32).collect();
        let expected: Vec<f32> = data.iter().map(|v| v + 1.0).collect();
        let xt = TensorData::from_vec(data, &[64]);
        let ot = TensorData::zeros(&[64], ScalarType::Float);
        eval_kernel(
            stmt,
            vec![BufferArg::Buf(x), BufferArg::Buf(out)],
            &[CallArg::Ptr(xt.data_ptr()), CallArg::Ptr(ot.data_ptr())],
        );
        assert_eq!(ot.to_vec::<f32>(), expected);
    }

    #[test]
    fn test_scalar_var_argument() {
        let out = Buf::new("out", vec![Expr::long(1)], ScalarType::Long);
        let n = Var::new("n", ScalarType::Long);
        let stmt = Stmt::store(
            &out,
            vec![Expr::long(0)],
            Expr::Var(n.clone()) * Expr::long(3),
        );
        let ot = TensorData::zeros(&[1], ScalarType::Long);
        eval_kernel(
            stmt,
            vec![BufferArg::Var(n), BufferArg::Buf(out)],
            &[CallArg::Int(7), CallArg::Ptr(ot.data_ptr())],
        );
        assert_eq!(ot.to_vec::<i64>(), vec![21]);
    }

    #[test]
    fn test_allocate_backs_dynamic_intermediates() {
        let tmp = Buf::new("tmp", vec![Expr::long(2)], ScalarType::Float);
        let out = Buf::new("out", vec![Expr::long(2)], ScalarType::Float);
        let i = Var::new("i", ScalarType::Long);
        let j = Var::new("j", ScalarType::Long);
        let fill = Stmt::loop_over(
            i.clone(),
            Expr::long(2),
            Stmt::store(&tmp, vec![Expr::Var(i.clone())], Expr::from(5.0f32)),
        );
        let copy = Stmt::loop_over(
            j.clone(),
            Expr::long(2),
            Stmt::store(
                &out,
                vec![Expr::Var(j.clone())],
                Expr::load(&tmp, vec![Expr::Var(j.clone())]),
            ),
        );
        let stmt = Stmt::Block(vec![
            Stmt::Allocate(tmp.clone()),
            fill,
            copy,
            Stmt::Free(tmp),
        ]);
        let ot = TensorData::zeros(&[2], ScalarType::Float);
        eval_kernel(
            stmt,
            vec![BufferArg::Buf(out)],
            &[CallArg::Ptr(ot.data_ptr())],
        );
        assert_eq!(ot.to_vec::<f32>(), vec![5., 5.]);
    }

    #[test]
    fn test_masked_store() {
        let out = Buf::new("out", vec![Expr::long(3)], ScalarType::Float);
        let i = Var::new("i", ScalarType::Long);
        let store = Stmt::store(&out, vec![Expr::Var(i.clone())], Expr::from(1.0f32));
        let masked = Stmt::Cond {
            condition: Expr::Var(i.clone()).lt(Expr::long(3)),
            then_body: Box::new(store),
            else_body: None,
        };
        let stmt = Stmt::loop_over(i, Expr::long(4), masked);
        let ot = TensorData::zeros(&[3], ScalarType::Float);
        eval_kernel(
            stmt,
            vec![BufferArg::Buf(out)],
            &[CallArg::Ptr(ot.data_ptr())],
        );
        assert_eq!(ot.to_vec::<f32>(), vec![1., 1., 1.]);
    }
}
