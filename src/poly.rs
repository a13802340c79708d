use std::collections::BTreeSet;
use std::fmt;

use rand_chacha::ChaCha20Rng;

use crate::field::Field;
use crate::PartyId;

/// A univariate polynomial over F_p, coefficients in ascending degree order.
///
/// The zero polynomial and constants both report degree 0, which is what the
/// protocol's degree checks expect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Poly {
    coeffs: Vec<u64>,
}

impl Poly {
    pub fn zero() -> Poly {
        Poly { coeffs: Vec::new() }
    }

    pub fn constant(c: u64) -> Poly {
        Poly { coeffs: vec![c] }
    }

    pub fn from_coeffs(coeffs: Vec<u64>) -> Poly {
        Poly { coeffs }
    }

    pub fn coeff(&self, i: usize) -> u64 {
        self.coeffs.get(i).copied().unwrap_or(0)
    }

    pub fn set_coeff(&mut self, i: usize, val: u64) {
        if self.coeffs.len() <= i {
            self.coeffs.resize(i + 1, 0);
        }
        self.coeffs[i] = val;
    }

    pub fn is_zero(&self) -> bool {
        self.coeffs.iter().all(|&c| c == 0)
    }

    pub fn degree(&self) -> usize {
        self.coeffs.iter().rposition(|&c| c != 0).unwrap_or(0)
    }

    pub fn degree_is(&self, required: usize) -> bool {
        self.degree() == required
    }

    pub fn degree_at_most(&self, required: usize) -> bool {
        self.degree() <= required
    }

    pub fn eval(&self, f: Field, x: u64) -> u64 {
        let mut acc = 0u64;
        for &c in self.coeffs.iter().rev() {
            acc = f.add(f.mul(acc, x), c);
        }
        acc
    }

    /// Shares for parties 1..=n, i.e. the polynomial evaluated at each
    /// party index.
    pub fn eval_at_parties(&self, f: Field, n: usize) -> Vec<u64> {
        (1..=n).map(|i| self.eval(f, i as u64)).collect()
    }

    pub fn add(&self, f: Field, other: &Poly) -> Poly {
        let len = self.coeffs.len().max(other.coeffs.len());
        let coeffs = (0..len)
            .map(|i| f.add(self.coeff(i), other.coeff(i)))
            .collect();
        Poly { coeffs }
    }

    pub fn scalar_mul(&self, f: Field, c: u64) -> Poly {
        Poly {
            coeffs: self.coeffs.iter().map(|&a| f.mul(a, c)).collect(),
        }
    }

    pub fn neg(&self, f: Field) -> Poly {
        Poly {
            coeffs: self.coeffs.iter().map(|&a| f.neg(a)).collect(),
        }
    }

    pub fn mul(&self, f: Field, other: &Poly) -> Poly {
        if self.coeffs.is_empty() || other.coeffs.is_empty() {
            return Poly::zero();
        }
        let mut coeffs = vec![0u64; self.coeffs.len() + other.coeffs.len() - 1];
        for (i, &a) in self.coeffs.iter().enumerate() {
            if a == 0 {
                continue;
            }
            for (j, &b) in other.coeffs.iter().enumerate() {
                coeffs[i + j] = f.add(coeffs[i + j], f.mul(a, b));
            }
        }
        Poly { coeffs }
    }

    /// Uniform polynomial of exactly the requested degree with the constant
    /// coefficient pinned. The leading coefficient is bumped away from zero
    /// so the degree is exact.
    pub fn sample(f: Field, rng: &mut ChaCha20Rng, constant: u64, degree: usize) -> Poly {
        let mut coeffs: Vec<u64> = (0..=degree).map(|_| f.sample(rng)).collect();
        coeffs[0] = f.reduce(constant);
        if degree > 0 && coeffs[degree] == 0 {
            coeffs[degree] = 1;
        }
        Poly { coeffs }
    }
}

impl fmt::Display for Poly {
    fn fmt(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return write!(out, "0");
        }
        let mut first = true;
        for (i, &c) in self.coeffs.iter().enumerate() {
            if c == 0 {
                continue;
            }
            if !first {
                write!(out, " + ")?;
            }
            first = false;
            match i {
                0 => write!(out, "{c}")?,
                1 => write!(out, "{c}*x")?,
                _ => write!(out, "{c}*x^{i}")?,
            }
        }
        Ok(())
    }
}

/// A symmetric bivariate polynomial f(x, y) of degree `t` in each variable.
///
/// Symmetry means only the lower triangle plus the diagonal of the
/// coefficient matrix is stored; row i holds coefficients (i, 0..=i).
#[derive(Debug, Clone)]
pub struct SymmBivariatePoly {
    t: usize,
    rows: Vec<Vec<u64>>,
}

impl SymmBivariatePoly {
    pub fn new(t: usize) -> SymmBivariatePoly {
        SymmBivariatePoly {
            t,
            rows: (0..=t).map(|i| vec![0u64; i + 1]).collect(),
        }
    }

    pub fn coeff(&self, row: usize, col: usize) -> u64 {
        if col <= row {
            self.rows[row][col]
        } else {
            self.rows[col][row]
        }
    }

    pub fn set_coeff(&mut self, row: usize, col: usize, val: u64) {
        if col <= row {
            self.rows[row][col] = val;
        } else {
            self.rows[col][row] = val;
        }
    }

    /// Uniform sample with f(0,0) pinned to `constant` and f(t,t) forced
    /// nonzero so the effective degree is exactly t in each variable.
    pub fn sample(f: Field, rng: &mut ChaCha20Rng, constant: u64, t: usize) -> SymmBivariatePoly {
        let mut poly = SymmBivariatePoly::new(t);
        for row in 0..=t {
            for col in 0..=row {
                poly.rows[row][col] = f.sample(rng);
            }
        }
        if poly.rows[t][t] == 0 {
            poly.rows[t][t] = 1;
        }
        poly.rows[0][0] = f.reduce(constant);
        poly
    }

    /// f(k, y) as a univariate polynomial in y: each x-coefficient row is
    /// itself a polynomial in y evaluated at nothing - we evaluate in x = k.
    pub fn eval_at(&self, f: Field, k: u64) -> Poly {
        let mut result = Poly::zero();
        for j in 0..=self.t {
            // coefficient of y^j is sum_i coeff(i, j) * k^i
            let mut acc = 0u64;
            let mut kpow = 1u64;
            for i in 0..=self.t {
                acc = f.add(acc, f.mul(self.coeff(i, j), kpow));
                kpow = f.mul(kpow, k);
            }
            result.set_coeff(j, acc);
        }
        result
    }

    /// The scalar f(k, l).
    pub fn eval_pair(&self, f: Field, k: u64, l: u64) -> u64 {
        self.eval_at(f, l).eval(f, k)
    }
}

/// The recombination vector over the non-corrupt parties: entry i-1 holds
/// the Lagrange basis value delta_i(0) computed over the index set
/// {1..=n} minus the corrupt set, and 0 at corrupt positions.
///
/// Dotting it with a share vector reconstructs f(0).
pub fn recombination_vector(f: Field, n: usize, corrupt: &BTreeSet<PartyId>) -> Vec<u64> {
    let mut vec = vec![0u64; n];
    for i in 1..=n {
        if corrupt.contains(&i) {
            continue;
        }
        let mut num = 1u64;
        let mut den = 1u64;
        for j in 1..=n {
            if j == i || corrupt.contains(&j) {
                continue;
            }
            num = f.mul(num, f.reduce(j as u64));
            den = f.mul(den, f.sub(j as u64, i as u64));
        }
        vec[i - 1] = f.mul(num, f.inv(den));
    }
    vec
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::SeedableRng;

    fn field() -> Field {
        Field::new(2039)
    }

    #[test]
    fn degree_of_zero_and_constants() {
        assert_eq!(Poly::zero().degree(), 0);
        assert_eq!(Poly::constant(5).degree(), 0);
        assert!(Poly::zero().degree_at_most(0));
        let p = Poly::from_coeffs(vec![1, 0, 3, 0]);
        assert_eq!(p.degree(), 2);
        assert!(p.degree_is(2));
        assert!(!p.degree_at_most(1));
    }

    #[test]
    fn eval_and_ops() {
        let f = field();
        let p = Poly::from_coeffs(vec![7, 2, 1]); // 7 + 2x + x^2
        assert_eq!(p.eval(f, 0), 7);
        assert_eq!(p.eval(f, 3), 7 + 6 + 9);
        let q = Poly::from_coeffs(vec![1, 1]);
        assert_eq!(p.add(f, &q).eval(f, 5), f.add(p.eval(f, 5), q.eval(f, 5)));
        assert_eq!(
            p.mul(f, &q).eval(f, 5),
            f.mul(p.eval(f, 5), q.eval(f, 5))
        );
        assert_eq!(p.scalar_mul(f, 3).eval(f, 2), f.mul(3, p.eval(f, 2)));
        assert_eq!(f.add(p.neg(f).eval(f, 2), p.eval(f, 2)), 0);
    }

    #[test]
    fn sampled_polynomial_has_exact_degree_and_constant() {
        let f = field();
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        for d in 1..6 {
            let p = Poly::sample(f, &mut rng, 42, d);
            assert!(p.degree_is(d));
            assert_eq!(p.eval(f, 0), 42);
        }
    }

    #[test]
    fn bivariate_symmetry() {
        let f = field();
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        let b = SymmBivariatePoly::sample(f, &mut rng, 99, 3);
        assert_eq!(b.eval_pair(f, 0, 0), 99);
        for k in 1..5u64 {
            for l in 1..5u64 {
                assert_eq!(b.eval_pair(f, k, l), b.eval_pair(f, l, k));
            }
        }
        // f(k, y) evaluated at l agrees with the pair evaluation
        let fk = b.eval_at(f, 4);
        assert_eq!(fk.eval(f, 2), b.eval_pair(f, 2, 4));
        assert!(fk.degree_at_most(3));
    }

    #[test]
    fn recombination_recovers_constant_term() {
        let f = field();
        let mut rng = ChaCha20Rng::seed_from_u64(17);
        let secret = 1234;
        let p = Poly::sample(f, &mut rng, secret, 2);
        let n = 5;
        let shares = p.eval_at_parties(f, n);
        let r = recombination_vector(f, n, &BTreeSet::new());
        let mut acc = 0u64;
        for i in 0..n {
            acc = f.add(acc, f.mul(r[i], shares[i]));
        }
        assert_eq!(acc, secret);
    }

    #[test]
    fn recombination_skips_corrupt_parties() {
        let f = field();
        let mut rng = ChaCha20Rng::seed_from_u64(23);
        let p = Poly::sample(f, &mut rng, 77, 1);
        let n = 3;
        let shares = p.eval_at_parties(f, n);
        let corrupt: BTreeSet<PartyId> = [2].into_iter().collect();
        let r = recombination_vector(f, n, &corrupt);
        assert_eq!(r[1], 0);
        let mut acc = 0u64;
        for i in 0..n {
            acc = f.add(acc, f.mul(r[i], shares[i]));
        }
        assert_eq!(acc, 77);
    }
}
