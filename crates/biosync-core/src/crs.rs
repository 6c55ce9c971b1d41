//! Coordinate reference systems used by the warehouse and the area files.
//!
//! Only WGS84 and EUREF-FIN / TM35FIN are needed; the transverse Mercator
//! conversion follows the Krüger series on the GRS80 ellipsoid.

use std::fmt;
use std::str::FromStr;

use geo::{Coord, MapCoords};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Crs {
    /// EPSG:4326, x = longitude, y = latitude in degrees.
    Wgs84,
    /// EPSG:3067, x = easting, y = northing in metres.
    EurefFin,
}

impl Crs {
    pub fn epsg(self) -> u32 {
        match self {
            Crs::Wgs84 => 4326,
            Crs::EurefFin => 3067,
        }
    }

    /// Name the warehouse API expects in its `crs` parameter.
    pub fn api_name(self) -> &'static str {
        match self {
            Crs::Wgs84 => "WGS84",
            Crs::EurefFin => "EUREF",
        }
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.epsg())
    }
}

impl FromStr for Crs {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "WGS84" | "EPSG:4326" | "4326" => Ok(Crs::Wgs84),
            "EUREF" | "EUREF-FIN" | "TM35FIN" | "EPSG:3067" | "3067" => Ok(Crs::EurefFin),
            other => Err(format!("unsupported coordinate reference system `{other}`")),
        }
    }
}

pub fn reproject<G>(geometry: &G, from: Crs, to: Crs) -> G
where
    G: MapCoords<f64, f64, Output = G> + Clone,
{
    if from == to {
        return geometry.clone();
    }
    geometry.map_coords(|c| transform_coord(c, from, to))
}

pub fn transform_coord(coord: Coord<f64>, from: Crs, to: Crs) -> Coord<f64> {
    match (from, to) {
        (Crs::Wgs84, Crs::EurefFin) => tm35fin::forward(coord),
        (Crs::EurefFin, Crs::Wgs84) => tm35fin::inverse(coord),
        _ => coord,
    }
}

mod tm35fin {
    use geo::Coord;

    const A: f64 = 6_378_137.0;
    const F: f64 = 1.0 / 298.257_222_101;
    const K0: f64 = 0.9996;
    const LON0: f64 = 27.0;
    const E0: f64 = 500_000.0;

    struct Params {
        e: f64,
        a1: f64,
        forward: [f64; 4],
        inverse: [f64; 4],
    }

    fn params() -> Params {
        let n = F / (2.0 - F);
        let (n2, n3, n4) = (n * n, n * n * n, n * n * n * n);
        Params {
            e: (2.0 * F - F * F).sqrt(),
            a1: A / (1.0 + n) * (1.0 + n2 / 4.0 + n4 / 64.0),
            forward: [
                n / 2.0 - 2.0 / 3.0 * n2 + 5.0 / 16.0 * n3 + 41.0 / 180.0 * n4,
                13.0 / 48.0 * n2 - 3.0 / 5.0 * n3 + 557.0 / 1440.0 * n4,
                61.0 / 240.0 * n3 - 103.0 / 140.0 * n4,
                49561.0 / 161280.0 * n4,
            ],
            inverse: [
                n / 2.0 - 2.0 / 3.0 * n2 + 37.0 / 96.0 * n3 - 1.0 / 360.0 * n4,
                1.0 / 48.0 * n2 + 1.0 / 15.0 * n3 - 437.0 / 1440.0 * n4,
                17.0 / 480.0 * n3 - 37.0 / 840.0 * n4,
                4397.0 / 161280.0 * n4,
            ],
        }
    }

    pub(super) fn forward(coord: Coord<f64>) -> Coord<f64> {
        let p = params();
        let phi = coord.y.to_radians();
        let dl = (coord.x - LON0).to_radians();

        let q = phi.tan().asinh() - p.e * (p.e * phi.sin()).atanh();
        let beta = q.sinh().atan();
        let eta_p = (beta.cos() * dl.sin()).atanh();
        let xi_p = (beta.sin() * eta_p.cosh()).asin();

        let mut xi = xi_p;
        let mut eta = eta_p;
        for (i, h) in p.forward.iter().enumerate() {
            let k = 2.0 * (i as f64 + 1.0);
            xi += h * (k * xi_p).sin() * (k * eta_p).cosh();
            eta += h * (k * xi_p).cos() * (k * eta_p).sinh();
        }

        Coord {
            x: p.a1 * eta * K0 + E0,
            y: p.a1 * xi * K0,
        }
    }

    pub(super) fn inverse(coord: Coord<f64>) -> Coord<f64> {
        let p = params();
        let xi = coord.y / (p.a1 * K0);
        let eta = (coord.x - E0) / (p.a1 * K0);

        let mut xi_p = xi;
        let mut eta_p = eta;
        for (i, h) in p.inverse.iter().enumerate() {
            let k = 2.0 * (i as f64 + 1.0);
            xi_p -= h * (k * xi).sin() * (k * eta).cosh();
            eta_p -= h * (k * xi).cos() * (k * eta).sinh();
        }

        let beta = (xi_p.sin() / eta_p.cosh()).asin();
        let dl = (eta_p.tanh() / beta.cos()).asin();
        let q = beta.tan().asinh();
        let mut q_p = q + p.e * (p.e * q.tanh()).atanh();
        for _ in 0..4 {
            q_p = q + p.e * (p.e * q_p.tanh()).atanh();
        }

        Coord {
            x: LON0 + dl.to_degrees(),
            y: q_p.sinh().atan().to_degrees(),
        }
    }
}
