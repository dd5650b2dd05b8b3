use std::io::Cursor;
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use plotters::prelude::LineSeries;
use plotters::prelude::*;
use plotters::coord::types::RangedCoordf64;
use crate::drivers::error::DriverError;
use crate::drivers::SampleBuffer;
use crate::types::{FitResult, RatePoint};
#[derive(Clone, Debug)]
pub struct PlotStyle {
    pub width: u32,
    pub height: u32,
    pub background: RGBColor,
    pub marker: RGBColor,
    pub trend: RGBColor,
}
impl Default for PlotStyle {
    fn default() -> Self {
        Self {
            width: 900,
            height: 600,
            background: WHITE,
            marker: BLACK,
            trend: RED,
        }
    }
}
/// Pressure vs. time of one run with error bars, plus the fitted trend when
/// the fit succeeded. At most about `display_number` points are drawn.
pub fn render_run_png(
    samples: &SampleBuffer,
    fit: Option<&FitResult>,
    display_number: usize,
    style: &PlotStyle,
) -> Result<Vec<u8>, DriverError> {
    let Some(&t0) = samples.times().first() else {
        return Err(DriverError::Plot("run has no samples".into()));
    };
    let shown = samples.decimated(display_number);
    let points: Vec<(f64, f64, f64)> = shown
        .iter()
        .map(|s| ((s.timestamp - t0) / 60.0, s.value, s.uncertainty))
        .collect();
    let x_max = (samples.times().last().copied().unwrap_or(t0) - t0) / 60.0;
    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height))
            .into_drawing_area();
        root.fill(&style.background)?;
        let (y_lo, y_hi) = padded_bounds(points.iter().flat_map(|(_, v, e)| [v - e, v + e]));
        let mut chart = ChartBuilder::on(&root)
            .margin(10)
            .caption("Outgas rate measurement", ("sans-serif", 20))
            .set_label_area_size(LabelAreaPosition::Left, 70)
            .set_label_area_size(LabelAreaPosition::Bottom, 40)
            .build_cartesian_2d(0f64..x_max.max(1.0 / 60.0), y_lo..y_hi)?;
        chart
            .configure_mesh()
            .x_desc("time since start [min]")
            .y_desc("inner pressure [Pa]")
            .light_line_style(&style.marker.mix(0.05))
            .draw()?;
        if let Some(fit) = fit {
            let trend = [0.0, x_max].map(|x| (x, fit.predict(t0 + x * 60.0)));
            let color = style.trend;
            chart
                .draw_series(LineSeries::new(trend, &color))?
                .label(format!(
                    "slope : {:.4e} ± {:.2e} Pa/h",
                    fit.rate_per_hour(),
                    fit.rate_error_per_hour()
                ))
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &color));
        }
        draw_error_bars(&mut chart, &points, style)?;
        if fit.is_some() {
            chart
                .configure_series_labels()
                .border_style(&style.marker.mix(0.3))
                .background_style(&style.background)
                .draw()?;
        }
        root.present()?;
    }
    encode_png(&buffer, style.width, style.height)
}
/// Outgas rate of every run in a batch against the run start time.
pub fn render_rates_png(points: &[RatePoint], style: &PlotStyle) -> Result<Vec<u8>, DriverError> {
    let Some(first) = points.iter().map(|p| p.run_start_time).min() else {
        return Err(DriverError::Plot("no runs to plot".into()));
    };
    let data: Vec<(f64, f64, f64)> = points
        .iter()
        .map(|p| {
            let days = (p.run_start_time - first).num_seconds() as f64 / 86_400.0;
            (days, p.rate, p.rate_error)
        })
        .collect();
    let x_max = data.iter().map(|p| p.0).fold(0.0, f64::max);
    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height))
            .into_drawing_area();
        root.fill(&style.background)?;
        let (y_lo, y_hi) = padded_bounds(data.iter().flat_map(|(_, v, e)| [v - e, v + e]));
        let x_pad = (x_max * 0.05).max(0.5);
        let mut chart = ChartBuilder::on(&root)
            .margin(10)
            .caption("Out gas rate", ("sans-serif", 20))
            .set_label_area_size(LabelAreaPosition::Left, 70)
            .set_label_area_size(LabelAreaPosition::Bottom, 40)
            .build_cartesian_2d(-x_pad..x_max + x_pad, y_lo..y_hi)?;
        chart
            .configure_mesh()
            .x_desc(format!("days since {}", first.format("%Y/%m/%d %H:%M:%S")))
            .y_desc("Out Gas Rate [Pa/hour]")
            .light_line_style(&style.marker.mix(0.05))
            .draw()?;
        draw_error_bars(&mut chart, &data, style)?;
        root.present()?;
    }
    encode_png(&buffer, style.width, style.height)
}
fn draw_error_bars(
    chart: &mut ChartContext<'_, BitMapBackend<'_>, Cartesian2d<RangedCoordf64, RangedCoordf64>>,
    points: &[(f64, f64, f64)],
    style: &PlotStyle,
) -> Result<(), DriverError> {
    let color = style.marker;
    chart.draw_series(
        points
            .iter()
            .map(|&(x, y, err)| {
                ErrorBar::new_vertical(x, y - err, y, y + err, ShapeStyle::from(&color), 10)
            }),
    )?;
    chart.draw_series(
        points
            .iter()
            .map(|&(x, y, _)| Circle::new((x, y), 4, ShapeStyle::from(&color).stroke_width(1))),
    )?;
    Ok(())
}
/// Min/max of the values with 5 % headroom; a flat series gets a unit span.
pub fn padded_bounds(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if !lo.is_finite() {
        return (0.0, 1.0);
    }
    let span = hi - lo;
    if span <= f64::EPSILON * hi.abs().max(1e-300) {
        let pad = if lo == 0.0 { 1.0 } else { lo.abs() * 0.5 };
        return (lo - pad, hi + pad);
    }
    (lo - span * 0.05, hi + span * 0.05)
}
fn encode_png(buffer: &[u8], width: u32, height: u32) -> Result<Vec<u8>, DriverError> {
    let image = ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, buffer.to_vec())
        .ok_or_else(|| DriverError::Plot("failed to allocate image buffer".into()))?;
    let mut output = Vec::new();
    let dynamic = DynamicImage::ImageRgb8(image);
    dynamic.write_to(&mut Cursor::new(&mut output), ImageFormat::Png)?;
    Ok(output)
}
#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn bounds_cover_error_bars() {
        let (lo, hi) = padded_bounds([1.0, 3.0, 2.0].into_iter());
        assert!(lo < 1.0 && lo > 0.8);
        assert!(hi > 3.0 && hi < 3.2);
    }
    #[test]
    fn flat_series_gets_a_span() {
        let (lo, hi) = padded_bounds([2e-3, 2e-3].into_iter());
        assert!(lo < 2e-3 && hi > 2e-3);
        assert_eq!(padded_bounds(std::iter::empty()), (0.0, 1.0));
        let (lo, hi) = padded_bounds([0.0].into_iter());
        assert_eq!((lo, hi), (-1.0, 1.0));
    }
    #[test]
    fn empty_inputs_are_rejected() {
        let style = PlotStyle::default();
        assert!(matches!(
            render_run_png(&SampleBuffer::new(), None, 10, &style),
            Err(DriverError::Plot(_))
        ));
        assert!(matches!(render_rates_png(&[], &style), Err(DriverError::Plot(_))));
    }
    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";
    #[test]
    fn fitted_run_renders_png() {
        let mut samples = SampleBuffer::new();
        for i in 0..60 {
            let value = 1e-2 + 1e-5 * i as f64;
            samples
                .push(crate::types::Sample {
                    timestamp: 1_700_000_000.0 + 2.0 * i as f64,
                    value,
                    uncertainty: value * 0.1,
                })
                .unwrap();
        }
        let fit = FitResult {
            slope: 5e-6,
            slope_error: 1e-7,
            intercept: 1e-2 - 5e-6 * 1_700_000_000.0,
            intercept_error: 1e-3,
            chi_square: 0.1,
            degrees_of_freedom: 57,
        };
        let style = PlotStyle::default();
        let png = render_run_png(&samples, Some(&fit), 10, &style).unwrap();
        assert!(png.starts_with(PNG_MAGIC));
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (style.width, style.height));
    }
    #[test]
    fn rates_render_png_with_negative_values() {
        let at = |s: &str| chrono::NaiveDateTime::parse_from_str(s, "%Y%m%d%H%M%S").unwrap();
        let points = [
            RatePoint {
                run_start_time: at("20240101000000"),
                rate: 0.36,
                rate_error: 0.02,
            },
            RatePoint {
                run_start_time: at("20240115000000"),
                rate: -0.01,
                rate_error: 0.03,
            },
        ];
        let png = render_rates_png(&points, &PlotStyle::default()).unwrap();
        assert!(png.starts_with(PNG_MAGIC));
    }
}
