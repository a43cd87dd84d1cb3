//! Elliptic-curve cryptography.


pub mod curves;


use num_bigint::BigUint;
use num_traits::{One, Zero};

use crate::crypt::{to_fixed_be_bytes, byte_length, Error};
use crate::security_info::EcParameters;


/// A point in affine coordinates.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AffinePoint {
    x: BigUint,
    y: BigUint,
}
impl AffinePoint {
    pub const fn new(x: BigUint, y: BigUint) -> Self {
        Self { x, y }
    }

    pub fn x(&self) -> &BigUint { &self.x }
    pub fn y(&self) -> &BigUint { &self.y }

    pub fn to_be_bytes(&self, bytes_per_component: usize) -> Vec<u8> {
        let mut ret = Vec::with_capacity(1 + 2*bytes_per_component);
        ret.push(0x04); // uncompressed coordinates
        ret.extend(to_fixed_be_bytes(&self.x, bytes_per_component));
        ret.extend(to_fixed_be_bytes(&self.y, bytes_per_component));
        ret
    }

    pub fn try_from_be_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 3 {
            // mode x y
            return None;
        }
        if bytes[0] != 0x04 {
            // we only support the uncompressed representation
            return None;
        }
        if (bytes.len() - 1) % 2 != 0 {
            // it must be possible to split the value in the middle
            return None;
        }
        let coordinate_length = (bytes.len() - 1) / 2;

        let x = BigUint::from_bytes_be(&bytes[1..1+coordinate_length]);
        let y = BigUint::from_bytes_be(&bytes[1+coordinate_length..]);
        Some(Self { x, y })
    }
}


/// Arithmetic modulo the prime of a curve. All operands are expected to be reduced.
struct Field<'p> {
    prime: &'p BigUint,
}
impl<'p> Field<'p> {
    fn add(&self, lhs: &BigUint, rhs: &BigUint) -> BigUint {
        (lhs + rhs) % self.prime
    }

    fn sub(&self, lhs: &BigUint, rhs: &BigUint) -> BigUint {
        ((lhs + self.prime) - rhs) % self.prime
    }

    fn mul(&self, lhs: &BigUint, rhs: &BigUint) -> BigUint {
        (lhs * rhs) % self.prime
    }

    fn invert(&self, value: &BigUint) -> Option<BigUint> {
        if value.is_zero() {
            return None;
        }
        // Fermat: value ** (p - 2) is the inverse for prime p
        let exponent = self.prime - BigUint::from(2u8);
        Some(value.modpow(&exponent, self.prime))
    }
}


/// A point in projective coordinates.
#[derive(Clone, Debug, Eq, PartialEq)]
struct ProjectivePoint {
    x: BigUint,
    y: BigUint,
    z: BigUint,
}
impl ProjectivePoint {
    fn infinity() -> Self {
        Self { x: BigUint::zero(), y: BigUint::one(), z: BigUint::zero() }
    }

    fn from_affine(point: &AffinePoint) -> Self {
        Self { x: point.x.clone(), y: point.y.clone(), z: BigUint::one() }
    }

    fn is_infinity(&self) -> bool {
        self.z.is_zero()
    }
}


/// An elliptic curve of the form `y**2 ≡ x**3 + ax + b` modulo a prime number.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PrimeWeierstrassCurve {
    /// The prime (modulus) of the curve.
    prime: BigUint,

    /// Coefficient `a` in the curve's formula.
    coefficient_a: BigUint,

    /// Coefficient `b` in the curve's formula.
    coefficient_b: BigUint,

    /// The coordinates of the generator point of the curve.
    generator: AffinePoint,

    /// The order of the group generated by the generator.
    order: BigUint,

    /// The cofactor of the curve.
    ///
    /// A cofactor n means that only each nth point on the curve is part of the group.
    cofactor: u64,
}
impl PrimeWeierstrassCurve {
    pub fn new(
        prime: BigUint,
        coefficient_a: BigUint,
        coefficient_b: BigUint,
        generator: AffinePoint,
        order: BigUint,
        cofactor: u64,
    ) -> Result<Self, Error> {
        if prime <= BigUint::from(3u8) || !prime.bit(0) {
            return Err(Error::InvalidDomainParameters("prime is not odd"));
        }
        if order <= BigUint::one() {
            return Err(Error::InvalidDomainParameters("order too small"));
        }
        if cofactor == 0 {
            return Err(Error::InvalidDomainParameters("cofactor is zero"));
        }

        let coefficient_a = coefficient_a % &prime;
        let coefficient_b = coefficient_b % &prime;
        let curve = Self::new_unchecked(prime, coefficient_a, coefficient_b, generator, order, cofactor);
        if !curve.is_on_curve_affine(&curve.generator) {
            return Err(Error::InvalidDomainParameters("generator is not on curve"));
        }
        Ok(curve)
    }

    /// Creates a curve from parameters known to be valid.
    pub(crate) fn new_unchecked(
        prime: BigUint,
        coefficient_a: BigUint,
        coefficient_b: BigUint,
        generator: AffinePoint,
        order: BigUint,
        cofactor: u64,
    ) -> Self {
        Self {
            prime,
            coefficient_a,
            coefficient_b,
            generator,
            order,
            cofactor,
        }
    }

    /// Creates a curve from domain parameters given explicitly in an ASN.1 structure.
    pub fn from_explicit(parameters: &EcParameters) -> Result<Self, Error> {
        let generator = AffinePoint::try_from_be_bytes(&parameters.base)
            .ok_or(Error::InvalidDomainParameters("generator is not an uncompressed point"))?;
        Self::new(
            BigUint::from_bytes_be(&parameters.prime),
            BigUint::from_bytes_be(&parameters.coefficient_a),
            BigUint::from_bytes_be(&parameters.coefficient_b),
            generator,
            BigUint::from_bytes_be(&parameters.order),
            parameters.cofactor.unwrap_or(1),
        )
    }

    pub fn prime(&self) -> &BigUint { &self.prime }
    pub fn coefficient_a(&self) -> &BigUint { &self.coefficient_a }
    pub fn coefficient_b(&self) -> &BigUint { &self.coefficient_b }
    pub fn generator(&self) -> &AffinePoint { &self.generator }
    pub fn order(&self) -> &BigUint { &self.order }
    pub fn cofactor(&self) -> u64 { self.cofactor }

    /// The number of bytes in each coordinate of an encoded point.
    pub fn prime_len_bytes(&self) -> usize {
        byte_length(&self.prime)
    }

    /// The number of bytes a private key used with this curve should have.
    pub fn order_len_bytes(&self) -> usize {
        byte_length(&self.order)
    }

    fn field(&self) -> Field<'_> {
        Field { prime: &self.prime }
    }

    fn internal_is_on_curve(&self, point: &ProjectivePoint) -> bool {
        match self.internal_to_affine(point) {
            Some(affine) => self.is_on_curve_affine(&affine),
            None => false,
        }
    }

    fn internal_to_affine(&self, point: &ProjectivePoint) -> Option<AffinePoint> {
        let field = self.field();
        let inverse = field.invert(&point.z)?;
        Some(AffinePoint {
            x: field.mul(&point.x, &inverse),
            y: field.mul(&point.y, &inverse),
        })
    }

    fn internal_double_point(&self, point: &ProjectivePoint) -> ProjectivePoint {
        // Renes/Costello/Batina 2015 (https://eprint.iacr.org/2015/1060), Algorithm 3
        let f = self.field();
        let a = &self.coefficient_a;
        let b3 = f.add(&f.add(&self.coefficient_b, &self.coefficient_b), &self.coefficient_b);

        // 1. t0 ← X · X
        let mut t0 = f.mul(&point.x, &point.x);
        // 2. t1 ← Y · Y
        let t1 = f.mul(&point.y, &point.y);
        // 3. t2 ← Z · Z
        let mut t2 = f.mul(&point.z, &point.z);
        // 4. t3 ← X · Y
        let mut t3 = f.mul(&point.x, &point.y);
        // 5. t3 ← t3 + t3
        t3 = f.add(&t3, &t3);
        // 6. Z3 ← X · Z
        let mut z3 = f.mul(&point.x, &point.z);
        // 7. Z3 ← Z3 + Z3
        z3 = f.add(&z3, &z3);
        // 8. X3 ← a · Z3
        let mut x3 = f.mul(a, &z3);
        // 9. Y3 ← b3 · t2
        let mut y3 = f.mul(&b3, &t2);
        // 10. Y3 ← X3 + Y3
        y3 = f.add(&x3, &y3);
        // 11. X3 ← t1 − Y3
        x3 = f.sub(&t1, &y3);
        // 12. Y3 ← t1 + Y3
        y3 = f.add(&t1, &y3);
        // 13. Y3 ← X3 · Y3
        y3 = f.mul(&x3, &y3);
        // 14. X3 ← t3 · X3
        x3 = f.mul(&t3, &x3);
        // 15. Z3 ← b3 · Z3
        z3 = f.mul(&b3, &z3);
        // 16. t2 ← a · t2
        t2 = f.mul(a, &t2);
        // 17. t3 ← t0 − t2
        t3 = f.sub(&t0, &t2);
        // 18. t3 ← a · t3
        t3 = f.mul(a, &t3);
        // 19. t3 ← t3 + Z3
        t3 = f.add(&t3, &z3);
        // 20. Z3 ← t0 + t0
        z3 = f.add(&t0, &t0);
        // 21. t0 ← Z3 + t0
        t0 = f.add(&z3, &t0);
        // 22. t0 ← t0 + t2
        t0 = f.add(&t0, &t2);
        // 23. t0 ← t0 · t3
        t0 = f.mul(&t0, &t3);
        // 24. Y3 ← Y3 + t0
        y3 = f.add(&y3, &t0);
        // 25. t2 ← Y · Z
        t2 = f.mul(&point.y, &point.z);
        // 26. t2 ← t2 + t2
        t2 = f.add(&t2, &t2);
        // 27. t0 ← t2 · t3
        t0 = f.mul(&t2, &t3);
        // 28. X3 ← X3 − t0
        x3 = f.sub(&x3, &t0);
        // 29. Z3 ← t2 · t1
        z3 = f.mul(&t2, &t1);
        // 30. Z3 ← Z3 + Z3
        z3 = f.add(&z3, &z3);
        // 31. Z3 ← Z3 + Z3
        z3 = f.add(&z3, &z3);
        ProjectivePoint { x: x3, y: y3, z: z3 }
    }

    fn internal_add_points(&self, lhs: &ProjectivePoint, rhs: &ProjectivePoint) -> ProjectivePoint {
        // Renes/Costello/Batina 2015 (https://eprint.iacr.org/2015/1060), Algorithm 1
        let f = self.field();
        let a = &self.coefficient_a;
        let b3 = f.add(&f.add(&self.coefficient_b, &self.coefficient_b), &self.coefficient_b);

        // 1. t0 ← X1 · X2
        let mut t0 = f.mul(&lhs.x, &rhs.x);
        // 2. t1 ← Y1 · Y2
        let mut t1 = f.mul(&lhs.y, &rhs.y);
        // 3. t2 ← Z1 · Z2
        let mut t2 = f.mul(&lhs.z, &rhs.z);
        // 4. t3 ← X1 + Y1
        let mut t3 = f.add(&lhs.x, &lhs.y);
        // 5. t4 ← X2 + Y2
        let mut t4 = f.add(&rhs.x, &rhs.y);
        // 6. t3 ← t3 · t4
        t3 = f.mul(&t3, &t4);
        // 7. t4 ← t0 + t1
        t4 = f.add(&t0, &t1);
        // 8. t3 ← t3 − t4
        t3 = f.sub(&t3, &t4);
        // 9. t4 ← X1 + Z1
        t4 = f.add(&lhs.x, &lhs.z);
        // 10. t5 ← X2 + Z2
        let mut t5 = f.add(&rhs.x, &rhs.z);
        // 11. t4 ← t4 · t5
        t4 = f.mul(&t4, &t5);
        // 12. t5 ← t0 + t2
        t5 = f.add(&t0, &t2);
        // 13. t4 ← t4 − t5
        t4 = f.sub(&t4, &t5);
        // 14. t5 ← Y1 + Z1
        t5 = f.add(&lhs.y, &lhs.z);
        // 15. X3 ← Y2 + Z2
        let mut x3 = f.add(&rhs.y, &rhs.z);
        // 16. t5 ← t5 · X3
        t5 = f.mul(&t5, &x3);
        // 17. X3 ← t1 + t2
        x3 = f.add(&t1, &t2);
        // 18. t5 ← t5 − X3
        t5 = f.sub(&t5, &x3);
        // 19. Z3 ← a · t4
        let mut z3 = f.mul(a, &t4);
        // 20. X3 ← b3 · t2
        x3 = f.mul(&b3, &t2);
        // 21. Z3 ← X3 + Z3
        z3 = f.add(&x3, &z3);
        // 22. X3 ← t1 − Z3
        x3 = f.sub(&t1, &z3);
        // 23. Z3 ← t1 + Z3
        z3 = f.add(&t1, &z3);
        // 24. Y3 ← X3 · Z3
        let mut y3 = f.mul(&x3, &z3);
        // 25. t1 ← t0 + t0
        t1 = f.add(&t0, &t0);
        // 26. t1 ← t1 + t0
        t1 = f.add(&t1, &t0);
        // 27. t2 ← a · t2
        t2 = f.mul(a, &t2);
        // 28. t4 ← b3 · t4
        t4 = f.mul(&b3, &t4);
        // 29. t1 ← t1 + t2
        t1 = f.add(&t1, &t2);
        // 30. t2 ← t0 − t2
        t2 = f.sub(&t0, &t2);
        // 31. t2 ← a · t2
        t2 = f.mul(a, &t2);
        // 32. t4 ← t4 + t2
        t4 = f.add(&t4, &t2);
        // 33. t0 ← t1 · t4
        t0 = f.mul(&t1, &t4);
        // 34. Y3 ← Y3 + t0
        y3 = f.add(&y3, &t0);
        // 35. t0 ← t5 · t4
        t0 = f.mul(&t5, &t4);
        // 36. X3 ← t3 · X3
        x3 = f.mul(&t3, &x3);
        // 37. X3 ← X3 − t0
        x3 = f.sub(&x3, &t0);
        // 38. t0 ← t3 · t1
        t0 = f.mul(&t3, &t1);
        // 39. Z3 ← t5 · Z3
        z3 = f.mul(&t5, &z3);
        // 40. Z3 ← Z3 + t0
        z3 = f.add(&z3, &t0);
        ProjectivePoint { x: x3, y: y3, z: z3 }
    }

    fn internal_multiply_scalar_with_point(&self, scalar: &BigUint, point: &ProjectivePoint) -> ProjectivePoint {
        let mut result = ProjectivePoint::infinity();
        let mut double_me = point.clone();
        for i in 0..scalar.bits() {
            if scalar.bit(i) {
                result = self.internal_add_points(&result, &double_me);
            }
            double_me = self.internal_double_point(&double_me);
        }
        debug_assert!(result.is_infinity() || self.internal_is_on_curve(&result));
        result
    }

    /// Checks whether the point lies on the curve.
    ///
    /// Coordinates that are not reduced modulo the prime are rejected.
    pub fn is_on_curve_affine(&self, point: &AffinePoint) -> bool {
        if point.x >= self.prime || point.y >= self.prime {
            return false;
        }
        let f = self.field();
        let y_squared = f.mul(&point.y, &point.y);
        let x_cubed = f.mul(&f.mul(&point.x, &point.x), &point.x);
        let ax = f.mul(&self.coefficient_a, &point.x);
        let rhs = f.add(&f.add(&x_cubed, &ax), &self.coefficient_b);
        y_squared == rhs
    }

    /// Multiplies `point` by `scalar`, returning `None` for the point at infinity.
    pub fn multiply(&self, scalar: &BigUint, point: &AffinePoint) -> Option<AffinePoint> {
        let product = self.internal_multiply_scalar_with_point(scalar, &ProjectivePoint::from_affine(point));
        self.internal_to_affine(&product)
    }

    /// Calculates `u1 * generator + u2 * point`, returning `None` for the point at infinity.
    pub fn linear_combination(&self, u1: &BigUint, u2: &BigUint, point: &AffinePoint) -> Option<AffinePoint> {
        let first = self.internal_multiply_scalar_with_point(u1, &ProjectivePoint::from_affine(&self.generator));
        let second = self.internal_multiply_scalar_with_point(u2, &ProjectivePoint::from_affine(point));
        let sum = self.internal_add_points(&first, &second);
        self.internal_to_affine(&sum)
    }

    /// Calculates a public key from a private key.
    pub fn calculate_public_key(&self, private_key: &BigUint) -> Result<AffinePoint, Error> {
        // public_key = private_key * generator
        self.multiply(private_key, &self.generator)
            .ok_or(Error::PointAtInfinity)
    }

    pub fn diffie_hellman(&self, private_key: &BigUint, other_public_key: &AffinePoint) -> Result<AffinePoint, Error> {
        // secret_key = private_key * other_public_key
        if !self.is_on_curve_affine(other_public_key) {
            return Err(Error::InvalidPublicKey);
        }
        self.multiply(private_key, other_public_key)
            .ok_or(Error::PointAtInfinity)
    }

    pub fn derive_generic_mapping_session_curve(&self, nonce: &BigUint, shared_secret: &AffinePoint) -> Result<Self, Error> {
        // new_generator = (nonce * original_generator) + shared_secret
        let new_generator = self.linear_combination(nonce, &BigUint::one(), shared_secret)
            .ok_or(Error::PointAtInfinity)?;
        debug_assert!(self.is_on_curve_affine(&new_generator));

        Ok(Self {
            prime: self.prime.clone(),
            coefficient_a: self.coefficient_a.clone(),
            coefficient_b: self.coefficient_b.clone(),
            generator: new_generator,
            order: self.order.clone(),
            cofactor: self.cofactor,
        })
    }
}
